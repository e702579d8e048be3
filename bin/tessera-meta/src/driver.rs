//! Single-node log driver.
//!
//! Each input line is a client request. Accepted requests are assigned the
//! next log index, applied, and answered once their flush future resolves.
//! Replies are written in input order.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tessera_common::UserInfo;
use tessera_meta_apply::{ClientResponse, MetaRequest, RequestPipeline};
use tessera_meta_store::FlushFuture;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Replies waiting on durability before they are written
const REPLY_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Reply {
    Response {
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<u64>,
        #[serde(flatten)]
        response: ClientResponse,
    },
    Malformed {
        error: String,
    },
}

enum Outcome {
    Ready(Reply),
    Pending {
        index: u64,
        response: ClientResponse,
        flush: FlushFuture,
    },
}

/// Counters for one [`Driver::run`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverStats {
    pub applied: u64,
    pub rejected: u64,
    pub malformed: u64,
}

pub struct Driver {
    pipeline: Arc<RequestPipeline>,
    caller: UserInfo,
    next_index: u64,
}

impl Driver {
    /// Resume after the last durable index of the store.
    pub fn new(pipeline: Arc<RequestPipeline>, caller: UserInfo) -> Result<Self> {
        let next_index = pipeline
            .manager()
            .applied_index()
            .context("failed to read applied index")?
            .map_or(1, |index| index + 1);
        Ok(Self {
            pipeline,
            caller,
            next_index,
        })
    }

    pub const fn next_index(&self) -> u64 {
        self.next_index
    }

    pub async fn run<R, W>(&mut self, input: R, output: W) -> Result<DriverStats>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(REPLY_QUEUE_DEPTH);
        let writer = tokio::spawn(write_replies(rx, output));

        let mut stats = DriverStats::default();
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.context("failed to read request")? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let outcome = self.handle(line, &mut stats)?;
            if tx.send(outcome).await.is_err() {
                // Writer gave up; its error is reported below
                break;
            }
        }
        drop(tx);

        writer.await.context("reply writer task failed")??;
        Ok(stats)
    }

    fn handle(&mut self, line: &str, stats: &mut DriverStats) -> Result<Outcome> {
        let request: MetaRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed request: {e}");
                stats.malformed += 1;
                return Ok(Outcome::Ready(Reply::Malformed {
                    error: e.to_string(),
                }));
            }
        };

        let cmd = request.cmd();
        let request = match self.pipeline.pre_execute(request, &self.caller) {
            Ok(request) => request,
            Err(e) => {
                stats.rejected += 1;
                return Ok(Outcome::Ready(Reply::Response {
                    index: None,
                    response: ClientResponse::error(cmd, &e),
                }));
            }
        };

        let index = self.next_index;
        let applied = self.pipeline.apply(&request, index)?;
        self.next_index += 1;
        stats.applied += 1;
        debug!("Entry {index} ({cmd}) applied, awaiting flush");

        Ok(Outcome::Pending {
            index,
            response: applied.response,
            flush: applied.flush,
        })
    }
}

async fn write_replies<W>(mut rx: mpsc::Receiver<Outcome>, mut output: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(outcome) = rx.recv().await {
        let reply = match outcome {
            Outcome::Ready(reply) => reply,
            Outcome::Pending {
                index,
                response,
                flush,
            } => {
                flush
                    .await
                    .with_context(|| format!("entry {index} was not persisted"))?;
                Reply::Response {
                    index: Some(index),
                    response,
                }
            }
        };
        let mut line = serde_json::to_vec(&reply).context("failed to encode reply")?;
        line.push(b'\n');
        output.write_all(&line).await?;
    }
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tessera_common::MetaConfig;

    const INPUT: &str = r#"{"type":"CreateS3Bucket","user":"alice","s3_bucket":"logs"}
{"type":"CreateS3Bucket","user":"bob","s3_bucket":"logs"}

{"type":"CreateS3Bucket","user":"alice","s3_bucket":"ab"}
not json
{"type":"DeleteS3Bucket","s3_bucket":"logs"}
"#;

    async fn run_once(config: &MetaConfig, input: &str, out: &std::path::Path) -> (DriverStats, u64) {
        let pipeline = Arc::new(RequestPipeline::open(config).unwrap());
        let flusher = pipeline.buffer().start();
        let mut driver = Driver::new(Arc::clone(&pipeline), UserInfo::new("admin")).unwrap();
        let output = tokio::fs::File::create(out).await.unwrap();
        let stats = driver.run(input.as_bytes(), output).await.unwrap();
        pipeline.buffer().shutdown();
        flusher.await.unwrap();
        (stats, driver.next_index())
    }

    #[tokio::test]
    async fn test_replies_in_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MetaConfig::default();
        config.store.db_path = dir.path().join("meta.redb");
        let out = dir.path().join("replies.jsonl");

        let (stats, next) = run_once(&config, INPUT, &out).await;
        assert_eq!(
            stats,
            DriverStats {
                applied: 3,
                rejected: 1,
                malformed: 1,
            }
        );
        assert_eq!(next, 4);

        let text = std::fs::read_to_string(&out).unwrap();
        let replies: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(replies.len(), 5);

        assert_eq!(replies[0]["index"], 1);
        assert_eq!(replies[0]["status"], "OK");
        assert_eq!(replies[0]["payload"]["mapping"], "s3alice/logs");
        assert_eq!(replies[0]["side_effects"][0]["volume"], "s3alice");

        assert_eq!(replies[1]["index"], 2);
        assert_eq!(replies[1]["status"]["FAILED"], "S3_BUCKET_ALREADY_EXISTS");

        assert!(replies[2].get("index").is_none());
        assert_eq!(replies[2]["status"]["FAILED"], "S3_BUCKET_INVALID_LENGTH");

        assert!(replies[3]["error"].is_string());

        assert_eq!(replies[4]["index"], 3);
        assert_eq!(replies[4]["status"], "OK");
    }

    #[tokio::test]
    async fn test_restart_resumes_after_applied_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MetaConfig::default();
        config.store.db_path = dir.path().join("meta.redb");
        let out = dir.path().join("replies.jsonl");

        let (_, next) = run_once(&config, INPUT, &out).await;
        assert_eq!(next, 4);

        let input = "{\"type\":\"CreateS3Bucket\",\"user\":\"alice\",\"s3_bucket\":\"logs\"}\n";
        let (stats, next) = run_once(&config, input, &out).await;
        assert_eq!(stats.applied, 1);
        assert_eq!(next, 5);

        let text = std::fs::read_to_string(&out).unwrap();
        let reply: Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(reply["index"], 4);
        assert_eq!(reply["status"], "OK");
        assert!(reply.get("side_effects").is_none());
    }
}
