use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SshClient {
    session: ssh2::Session,
}

impl SshClient {
    pub fn new() -> Result<SshClient> {
        let session = ssh2::Session::new()?;
        Ok(SshClient { session })
    }

    pub async fn connect(
        &mut self,
        host: impl ToSocketAddrs,
        username: &str,
        key: &Path,
    ) -> Result<()> {
        let tcp = TcpStream::connect(host).await?.into_std()?;
        tcp.set_nonblocking(false)?;
        self.session.set_tcp_stream(tcp);
        self.session.handshake()?;
        self.session.userauth_pubkey_file(username, None, key, None)?;
        Ok(())
    }

    pub async fn execute(&mut self, command: &str) -> Result<(i32, String)> {
        info!("Executing command: {}", command);
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;
        let mut s = String::new();
        channel.read_to_string(&mut s)?;
        channel.wait_close()?;
        Ok((channel.exit_status()?, s))
    }
}

/// Runs shell commands on the build VM.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Exit status and combined output of `command` on `host`
    async fn execute(&self, host: &str, command: &str) -> Result<(i32, String)>;

    /// Whether `host` accepts connections on the communicator port
    async fn is_reachable(&self, host: &str) -> bool;
}

/// [`Communicator`] opening one SSH session per command.
#[derive(Debug, Clone)]
pub struct SshCommunicator {
    pub username: String,
    pub private_key: PathBuf,
    pub port: u16,
}

#[async_trait]
impl Communicator for SshCommunicator {
    async fn execute(&self, host: &str, command: &str) -> Result<(i32, String)> {
        let mut client = SshClient::new()?;
        client
            .connect((host, self.port), &self.username, &self.private_key)
            .await
            .with_context(|| format!("Failed to connect to {}:{}", host, self.port))?;
        client.execute(command).await
    }

    async fn is_reachable(&self, host: &str) -> bool {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect((host, self.port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("{}:{} not reachable: {}", host, self.port, e);
                false
            }
            Err(_) => false,
        }
    }
}
