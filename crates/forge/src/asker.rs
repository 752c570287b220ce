//! Interactive question answering.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tokio::sync::Mutex;

/// Answers questions raised during a run.
#[async_trait]
pub trait Asker: Send + Sync {
    /// Ask `question` and wait for the answer.
    ///
    /// An error means the channel is gone and no further answers will come.
    async fn ask(&self, question: &str) -> std::io::Result<String>;
}

/// Asks on stdout and reads one line per answer from stdin.
#[derive(Debug)]
pub struct StdinAsker {
    input: Mutex<BufReader<Stdin>>,
}

impl Default for StdinAsker {
    fn default() -> Self {
        Self::new()
    }
}

impl StdinAsker {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }
}

#[async_trait]
impl Asker for StdinAsker {
    async fn ask(&self, question: &str) -> std::io::Result<String> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(format!("{question}\n> ").as_bytes()).await?;
        stdout.flush().await?;

        let mut line = String::new();
        if self.input.lock().await.read_line(&mut line).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "input closed",
            ));
        }
        Ok(line.trim().to_string())
    }
}
