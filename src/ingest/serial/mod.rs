pub mod error;
pub mod poll;

use std::io;
use std::time::Duration;

use error::SerialError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

#[derive(Debug, Deserialize, Serialize)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    pub timeout_secs: u64,
    pub terminator: Terminator,
    /// sensor the polled entities are registered under
    pub sensor: String,
    pub poll_interval_secs: u64,
    /// housekeeping commands run once per this many seconds
    pub monitor_interval_secs: u64,
}

/// Line terminator is a fixed per-deployment constant, control boards
/// differ on whether they expect a trailing newline.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub enum Terminator {
    Cr,
    CrLf,
}

impl Terminator {
    fn bytes(self) -> &'static [u8] {
        match self {
            Terminator::Cr => b"\r",
            Terminator::CrLf => b"\r\n",
        }
    }
}

/// One request/response exchange's worth of byte-stream access. The real
/// implementation wraps a serial port, tests script the reads.
pub trait LineTransport {
    fn clear_input(&mut self) -> impl Future<Output = io::Result<()>> + Send;
    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
    /// Read until `\n` or the configured timeout, returning whatever
    /// arrived (empty on a silent line).
    fn read_line(&mut self) -> impl Future<Output = io::Result<Vec<u8>>> + Send;
}

pub struct SerialPortTransport {
    port: SerialStream,
    timeout: Duration,
}

impl SerialPortTransport {
    pub fn open(path: &str, baud: u32, timeout: Duration) -> Result<Self, tokio_serial::Error> {
        let port = tokio_serial::new(path, baud).open_native_async()?;
        Ok(Self { port, timeout })
    }
}

impl LineTransport for SerialPortTransport {
    async fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(tokio_serial::ClearBuffer::Input)
            .map_err(io::Error::other)
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf).await
    }

    async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match tokio::time::timeout(self.timeout, self.port.read(&mut byte)).await {
                Err(_) | Ok(Ok(0)) => return Ok(line),
                Ok(Ok(_)) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        return Ok(line);
                    }
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }
}

/// Synchronous command protocol: send `"{CMD} {PARAM}"`, verify the echo,
/// parse `"{CMD} {KEY}={VALUE}"` and return the value. The link is an
/// exclusively-owned resource, one exchange in flight at a time.
pub struct SerialLink<T> {
    transport: T,
    terminator: Terminator,
}

impl<T: LineTransport> SerialLink<T> {
    pub fn new(transport: T, terminator: Terminator) -> Self {
        Self { transport, terminator }
    }

    pub async fn command(&mut self, cmd: &str, param: &str) -> Result<String, SerialError> {
        self.transport.clear_input().await?;

        let mut frame = format!("{cmd} {param}").into_bytes();
        frame.extend_from_slice(self.terminator.bytes());
        self.transport.write_all(&frame).await?;

        let mut echo = self.transport.read_line().await?;
        // a board with a bare \r terminator still echoes a trailing newline
        if self.terminator == Terminator::Cr && echo.last() == Some(&b'\n') {
            echo.pop();
        }
        if echo.is_empty() {
            return Err(SerialError::NoEcho);
        }
        if echo != frame {
            return Err(SerialError::EchoMismatch {
                sent: printable(&frame),
                received: printable(&echo),
            });
        }

        let resp = self.transport.read_line().await?;
        if resp.is_empty() {
            return Err(SerialError::NoResponse);
        }

        let text = String::from_utf8_lossy(&resp);
        let text = text.trim();
        let sections: Vec<&str> = text.split(' ').collect();
        if sections.len() != 2 {
            return Err(SerialError::MalformedResponse(text.to_string()));
        }
        if sections[0] != cmd {
            return Err(SerialError::CommandMismatch {
                sent: cmd.to_string(),
                received: sections[0].to_string(),
            });
        }
        let kv: Vec<&str> = sections[1].split('=').collect();
        if kv.len() != 2 {
            return Err(SerialError::MalformedResponse(text.to_string()));
        }

        Ok(kv[1].to_string())
    }
}

fn printable(line: &[u8]) -> String {
    String::from_utf8_lossy(line).trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    #[derive(Default)]
    struct ScriptedTransport {
        reads: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        cleared: usize,
    }

    impl ScriptedTransport {
        fn with_reads(reads: &[&[u8]]) -> Self {
            Self {
                reads: reads.iter().map(|r| r.to_vec()).collect(),
                ..Default::default()
            }
        }
    }

    impl LineTransport for ScriptedTransport {
        async fn clear_input(&mut self) -> io::Result<()> {
            self.cleared += 1;
            Ok(())
        }

        async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.written.extend_from_slice(buf);
            Ok(())
        }

        async fn read_line(&mut self) -> io::Result<Vec<u8>> {
            // an exhausted script behaves like a timed-out read
            Ok(self.reads.pop_front().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn returns_value_after_verified_echo() {
        let transport = ScriptedTransport::with_reads(&[
            b"VOLTAGE household\r\n",
            b"VOLTAGE v=12.4\r\n",
        ]);
        let mut link = SerialLink::new(transport, Terminator::CrLf);

        let value = link.command("VOLTAGE", "household").await.unwrap();
        assert_eq!(value, "12.4");
        assert_eq!(link.transport.written, b"VOLTAGE household\r\n");
        assert_eq!(link.transport.cleared, 1);
    }

    #[tokio::test]
    async fn echo_typo_is_a_mismatch_not_a_missing_echo() {
        let transport = ScriptedTransport::with_reads(&[
            b"VOLTAGE houshold\r\n",
            b"VOLTAGE v=12.4\r\n",
        ]);
        let mut link = SerialLink::new(transport, Terminator::CrLf);

        let err = link.command("VOLTAGE", "household").await.unwrap_err();
        assert!(matches!(err, SerialError::EchoMismatch { .. }), "{err}");
    }

    #[tokio::test]
    async fn silent_line_is_a_missing_echo() {
        let transport = ScriptedTransport::with_reads(&[]);
        let mut link = SerialLink::new(transport, Terminator::CrLf);

        let err = link.command("VOLTAGE", "household").await.unwrap_err();
        assert!(matches!(err, SerialError::NoEcho), "{err}");
    }

    #[tokio::test]
    async fn missing_response_after_echo() {
        let transport = ScriptedTransport::with_reads(&[b"PUMP ?\r\n"]);
        let mut link = SerialLink::new(transport, Terminator::CrLf);

        let err = link.command("PUMP", "?").await.unwrap_err();
        assert!(matches!(err, SerialError::NoResponse), "{err}");
    }

    #[tokio::test]
    async fn response_must_be_two_tokens() {
        let transport = ScriptedTransport::with_reads(&[
            b"PUMP ?\r\n",
            b"PUMP state=1 extra\r\n",
        ]);
        let mut link = SerialLink::new(transport, Terminator::CrLf);

        let err = link.command("PUMP", "?").await.unwrap_err();
        assert!(matches!(err, SerialError::MalformedResponse(_)), "{err}");
    }

    #[tokio::test]
    async fn response_value_must_contain_exactly_one_equals() {
        let transport = ScriptedTransport::with_reads(&[
            b"PUMP ?\r\n",
            b"PUMP state:1\r\n",
        ]);
        let mut link = SerialLink::new(transport, Terminator::CrLf);

        let err = link.command("PUMP", "?").await.unwrap_err();
        assert!(matches!(err, SerialError::MalformedResponse(_)), "{err}");

        let transport = ScriptedTransport::with_reads(&[
            b"PUMP ?\r\n",
            b"PUMP state=1=2\r\n",
        ]);
        let mut link = SerialLink::new(transport, Terminator::CrLf);

        let err = link.command("PUMP", "?").await.unwrap_err();
        assert!(matches!(err, SerialError::MalformedResponse(_)), "{err}");
    }

    #[tokio::test]
    async fn response_command_must_match_request() {
        let transport = ScriptedTransport::with_reads(&[
            b"WATER ?\r\n",
            b"WASTE state=1\r\n",
        ]);
        let mut link = SerialLink::new(transport, Terminator::CrLf);

        let err = link.command("WATER", "?").await.unwrap_err();
        assert!(matches!(err, SerialError::CommandMismatch { .. }), "{err}");
    }

    #[tokio::test]
    async fn bare_cr_terminator_tolerates_echoed_newline() {
        let transport = ScriptedTransport::with_reads(&[
            b"HOUSEHOLD 1\r\n",
            b"HOUSEHOLD state=1\r\n",
        ]);
        let mut link = SerialLink::new(transport, Terminator::Cr);

        let value = link.command("HOUSEHOLD", "1").await.unwrap();
        assert_eq!(value, "1");
        assert_eq!(link.transport.written, b"HOUSEHOLD 1\r");
    }
}
