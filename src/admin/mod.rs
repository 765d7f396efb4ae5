//! TCP admin protocol.
//!
//! Operators connect to ask for adaptive sample-rate advice. Each accepted
//! connection gets its own task; the listener itself is load-bearing, so an
//! accept failure is fatal for the daemon.

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::window::RateQuery;

const HELP_TEXT: &str = "
    commands:
        ideal_sample_rate <metric key>   get the ideal sample rate for given metric
        help                             show this menu

";

/// One parsed admin command.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Help,
    IdealSampleRate(&'a str),
    /// Known command with wrong arguments.
    InvalidRequest,
    Unknown,
}

fn parse_command(input: &str) -> Command<'_> {
    let mut words = input.split_whitespace();
    match words.next() {
        Some("help") => Command::Help,
        Some("ideal_sample_rate") => match (words.next(), words.next()) {
            (Some(bucket), None) => Command::IdealSampleRate(bucket),
            _ => Command::InvalidRequest,
        },
        _ => Command::Unknown,
    }
}

/// Admin protocol server.
pub struct AdminServer {
    listener: TcpListener,
    queries: mpsc::Sender<RateQuery>,
}

impl AdminServer {
    /// Binds the admin listener. A bind failure is fatal at startup.
    pub async fn bind(addr: &str, queries: mpsc::Sender<RateQuery>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("listening on {addr}"))?;

        Ok(Self { listener, queries })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().context("getting local address")
    }

    /// Accept loop. Returns an error only for accept failures, which the
    /// daemon treats as fatal.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        if let Ok(addr) = self.local_addr() {
            info!(%addr, "admin server listening");
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.context("accepting admin connection")?;
                    debug!(%peer, "admin connection accepted");
                    let queries = self.queries.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, queries).await;
                    });
                }
            }
        }
    }
}

/// Serves one admin connection until EOF or until a sample-rate reply
/// closes it.
async fn handle_connection<S>(mut stream: S, queries: mpsc::Sender<RateQuery>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 1024];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => {
                debug!("admin connection closed by peer");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "admin read error");
                continue;
            }
        };

        let text = String::from_utf8_lossy(&buf[..n]);
        let input = text.trim();
        debug!(command = input, "admin command received");

        match parse_command(input) {
            Command::Help => {
                if write_reply(&mut stream, HELP_TEXT).await.is_err() {
                    return;
                }
            }

            Command::IdealSampleRate(bucket) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let query = RateQuery {
                    bucket: bucket.to_string(),
                    reply: reply_tx,
                };
                if queries.send(query).await.is_err() {
                    warn!("observation window unavailable");
                    return;
                }
                match reply_rx.await {
                    Ok(rate) => {
                        let line = format!("{bucket} {rate:.6}\n");
                        let _ = write_reply(&mut stream, &line).await;
                    }
                    Err(_) => warn!("observation window dropped the query"),
                }
                // One answer per connection.
                return;
            }

            Command::InvalidRequest => {
                if write_reply(&mut stream, "invalid request\n").await.is_err()
                    || write_reply(&mut stream, HELP_TEXT).await.is_err()
                {
                    return;
                }
            }

            Command::Unknown => {
                if write_reply(&mut stream, "unknown command\n").await.is_err()
                    || write_reply(&mut stream, HELP_TEXT).await.is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn write_reply<S: AsyncWrite + Unpin>(stream: &mut S, text: &str) -> std::io::Result<()> {
    if let Err(e) = stream.write_all(text.as_bytes()).await {
        debug!(error = %e, "admin write failed");
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("help"), Command::Help);
        assert_eq!(
            parse_command("ideal_sample_rate api.latency"),
            Command::IdealSampleRate("api.latency"),
        );
        assert_eq!(parse_command("ideal_sample_rate"), Command::InvalidRequest);
        assert_eq!(
            parse_command("ideal_sample_rate a b"),
            Command::InvalidRequest,
        );
        assert_eq!(parse_command("flush"), Command::Unknown);
        assert_eq!(parse_command(""), Command::Unknown);
    }

    #[test]
    fn test_parse_command_tolerates_extra_whitespace() {
        assert_eq!(
            parse_command("  ideal_sample_rate   hot  "),
            Command::IdealSampleRate("hot"),
        );
    }

    #[tokio::test]
    async fn test_help_keeps_connection_open() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (query_tx, _query_rx) = mpsc::channel(8);
        let handler = tokio::spawn(handle_connection(server, query_tx));

        client.write_all(b"help\n").await.expect("write");
        let mut buf = vec![0u8; 1024];
        let n = client.read(&mut buf).await.expect("read");
        assert!(String::from_utf8_lossy(&buf[..n]).contains("ideal_sample_rate"));

        // Connection is still serving: a second command gets an answer.
        client.write_all(b"bogus\n").await.expect("write");
        let n = client.read(&mut buf).await.expect("read");
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("unknown command"));

        drop(client);
        handler.await.expect("handler exits on EOF");
    }

    #[tokio::test]
    async fn test_sample_rate_query_replies_and_closes() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (query_tx, mut query_rx) = mpsc::channel::<RateQuery>(8);
        let handler = tokio::spawn(handle_connection(server, query_tx));

        // Answer the forwarded query like the window task would.
        tokio::spawn(async move {
            let query = query_rx.recv().await.expect("query arrives");
            assert_eq!(query.bucket, "hot");
            query.reply.send(0.25).expect("reply");
        });

        client.write_all(b"ideal_sample_rate hot\n").await.expect("write");
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.expect("read to eof");
        assert_eq!(reply, "hot 0.250000\n");

        handler.await.expect("handler closed the connection");
    }

    #[tokio::test]
    async fn test_missing_argument_is_invalid_request() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (query_tx, _query_rx) = mpsc::channel(8);
        tokio::spawn(handle_connection(server, query_tx));

        client.write_all(b"ideal_sample_rate\n").await.expect("write");
        let mut buf = vec![0u8; 1024];
        let n = client.read(&mut buf).await.expect("read");
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("invalid request"));
    }
}
