//! Scripted ESL server for integration tests.
//!
//! Binds 127.0.0.1:0, accepts one connection and lets the test drive the
//! server side frame by frame.

#![allow(dead_code)]

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const PASSWORD: &str = "ClueCon";

pub struct ServerConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ServerConn {
    /// Read one command up to its blank-line terminator. Returns the lines
    /// joined with `\n`, without the terminator, or `None` on EOF.
    pub async fn read_command(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .expect("server read");
            if n == 0 {
                return None;
            }
            let line = line.trim_end_matches('\n');
            if line.is_empty() {
                if lines.is_empty() {
                    continue;
                }
                return Some(lines.join("\n"));
            }
            lines.push(line.to_string());
        }
    }

    pub async fn expect_command(&mut self, prefix: &str) -> String {
        let command = tokio::time::timeout(Duration::from_secs(5), self.read_command())
            .await
            .expect("timed out waiting for command")
            .expect("client closed before sending command");
        assert!(
            command.starts_with(prefix),
            "expected command starting with {:?}, got {:?}",
            prefix,
            command
        );
        command
    }

    pub async fn send_raw(&mut self, data: &str) {
        self.writer
            .write_all(data.as_bytes())
            .await
            .expect("server write");
    }

    pub async fn send_challenge(&mut self) {
        self.send_raw("Content-Type: auth/request\n\n")
            .await;
    }

    pub async fn send_reply(&mut self, reply_text: &str) {
        self.send_reply_with(reply_text, &[])
            .await;
    }

    pub async fn send_reply_with(&mut self, reply_text: &str, extra: &[(&str, &str)]) {
        let mut frame = format!(
            "Content-Type: command/reply\nReply-Text: {}\n",
            reply_text
        );
        for (name, value) in extra {
            frame.push_str(&format!("{}: {}\n", name, value));
        }
        frame.push('\n');
        self.send_raw(&frame)
            .await;
    }

    pub async fn send_api_response(&mut self, body: &str) {
        let frame = format!(
            "Content-Type: api/response\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        self.send_raw(&frame)
            .await;
    }

    /// Send a `text/event-plain` frame with the given event headers and an
    /// optional event body.
    pub async fn send_event(&mut self, headers: &[(&str, &str)], body: Option<&str>) {
        let mut inner = String::new();
        for (name, value) in headers {
            inner.push_str(&format!("{}: {}\n", name, value));
        }
        if let Some(body) = body {
            inner.push_str(&format!("Content-Length: {}\n\n{}", body.len(), body));
        } else {
            inner.push('\n');
        }
        let frame = format!(
            "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
            inner.len(),
            inner
        );
        self.send_raw(&frame)
            .await;
    }

    pub async fn send_background_job(&mut self, job_id: &str, result: &str) {
        self.send_event(
            &[
                ("Event-Name", "BACKGROUND_JOB"),
                ("Job-UUID", job_id),
                ("Job-Command", "status"),
            ],
            Some(result),
        )
        .await;
    }

    pub async fn send_channel_event(&mut self, event_name: &str, call_id: &str) {
        self.send_event(
            &[
                ("Event-Name", event_name),
                ("Unique-ID", call_id),
                ("Channel-State", "CS_EXECUTE"),
            ],
            None,
        )
        .await;
    }

    /// Challenge, read `auth <password>` and accept it.
    pub async fn accept_auth(&mut self) {
        self.send_challenge()
            .await;
        let command = self
            .expect_command("auth ")
            .await;
        assert_eq!(command, format!("auth {}", PASSWORD));
        self.send_reply("+OK accepted")
            .await;
    }

    pub async fn close(mut self) {
        let _ = self
            .writer
            .shutdown()
            .await;
    }
}

pub struct FakeServer {
    pub port: u16,
    conn: JoinHandle<ServerConn>,
}

impl FakeServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake server");
        let port = listener
            .local_addr()
            .expect("local_addr")
            .port();
        let conn = tokio::spawn(async move {
            let (socket, _) = listener
                .accept()
                .await
                .expect("accept");
            let (read_half, writer) = socket.into_split();
            ServerConn {
                reader: BufReader::new(read_half),
                writer,
            }
        });
        Self { port, conn }
    }

    pub async fn accept(self) -> ServerConn {
        self.conn
            .await
            .expect("accept task")
    }
}

/// Start a fake server that authenticates one client, then hand the server
/// side to `script`.
pub async fn serve<F, Fut>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(ServerConn) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let server = FakeServer::bind().await;
    let port = server.port;
    let handle = tokio::spawn(async move {
        let mut conn = server
            .accept()
            .await;
        conn.accept_auth()
            .await;
        script(conn).await;
    });
    (port, handle)
}
