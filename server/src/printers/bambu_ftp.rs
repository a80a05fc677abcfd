//! FTP client for Bambu printers.
//!
//! Bambu exposes FTP with *implicit* TLS on port 990: the TCP socket is
//! wrapped in TLS before any FTP byte is exchanged (this is not
//! `AUTH TLS`). Login is always the fixed user `bblp` with the printer's
//! access code, and data channels run in protected passive mode.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::tls::insecure_client_config;
use super::RemoteFile;
use crate::error::{Result, ServiceError};

pub const BAMBU_FTP_PORT: u16 = 990;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_CACHE_TTL: Duration = Duration::from_secs(30);

/// Directories scanned during filename discovery and inventory refresh.
pub const SCAN_DIRS: &[&str] = &["", "cache", "model", "timelapse", "sdcard", "usb", "USB", "gcodes"];

pub struct BambuFtp {
    host: String,
    access_code: String,
    port: u16,
    connector: TlsConnector,
    list_cache: Mutex<HashMap<String, (Instant, Vec<RemoteFile>)>>,
}

struct FtpResponse {
    code: u16,
    text: String,
}

/// One authenticated control connection with protected data channels.
struct FtpSession {
    control: BufReader<TlsStream<TcpStream>>,
    connector: TlsConnector,
    host: String,
}

impl BambuFtp {
    pub fn new(host: String, access_code: String) -> Arc<Self> {
        Self::with_port(host, access_code, BAMBU_FTP_PORT)
    }

    pub fn with_port(host: String, access_code: String, port: u16) -> Arc<Self> {
        Arc::new(Self {
            host,
            access_code,
            port,
            connector: TlsConnector::from(Arc::new(insecure_client_config())),
            list_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn has_credentials(&self) -> bool {
        !self.host.is_empty() && !self.access_code.is_empty()
    }

    async fn open_session(&self) -> Result<FtpSession> {
        let addr = format!("{}:{}", self.host, self.port);
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| ServiceError::TransientNetwork(format!("FTP connect timeout to {addr}")))?
            .map_err(|e| ServiceError::TransientNetwork(format!("FTP connect to {addr}: {e}")))?;

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| ServiceError::Config(format!("invalid FTP host {}: {e}", self.host)))?;

        // TLS first, greeting after: implicit TLS.
        let tls = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ServiceError::TransientNetwork(format!("FTP TLS handshake: {e}")))?;

        let mut session = FtpSession {
            control: BufReader::new(tls),
            connector: self.connector.clone(),
            host: self.host.clone(),
        };

        let greeting = session.read_response().await?;
        if greeting.code != 220 {
            return Err(ServiceError::Protocol(format!(
                "unexpected FTP greeting: {} {}",
                greeting.code, greeting.text
            )));
        }

        session.login("bblp", &self.access_code).await?;
        Ok(session)
    }

    /// Download `remote_path` to `local_path`, streaming in chunks.
    /// Returns the number of bytes written.
    pub async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        let mut session = self.open_session().await?;
        let bytes = session.retr_to_file(remote_path, local_path).await?;
        session.quit().await;
        Ok(bytes)
    }

    /// List one directory. Results are cached briefly so inventory
    /// refresh and path discovery don't hammer the printer.
    pub async fn list_dir(&self, dir: &str) -> Result<Vec<RemoteFile>> {
        {
            let cache = self.list_cache.lock().await;
            if let Some((at, entries)) = cache.get(dir) {
                if at.elapsed() < LIST_CACHE_TTL {
                    return Ok(entries.clone());
                }
            }
        }

        let mut session = self.open_session().await?;
        let entries = session.list(dir).await?;
        session.quit().await;

        self.list_cache
            .lock()
            .await
            .insert(dir.to_string(), (Instant::now(), entries.clone()));
        Ok(entries)
    }

    /// List every known directory, skipping the ones that fail.
    pub async fn list_known_dirs(&self) -> Vec<RemoteFile> {
        let mut all = Vec::new();
        for dir in SCAN_DIRS {
            match self.list_dir(dir).await {
                Ok(entries) => all.extend(entries),
                Err(e) => {
                    tracing::debug!(dir, error = %e, "directory listing failed");
                }
            }
        }
        all
    }
}

impl FtpSession {
    async fn read_response(&mut self) -> Result<FtpResponse> {
        let mut code = 0u16;
        let mut text = String::new();
        loop {
            let mut line = String::new();
            let n = self
                .control
                .read_line(&mut line)
                .await
                .map_err(|e| ServiceError::TransientNetwork(format!("FTP control read: {e}")))?;
            if n == 0 {
                return Err(ServiceError::TransientNetwork(
                    "FTP control connection closed".into(),
                ));
            }
            let trimmed = line.trim_end();
            if trimmed.len() >= 4 {
                if let Ok(parsed) = trimmed[..3].parse::<u16>() {
                    code = parsed;
                    text.push_str(&trimmed[4..]);
                    // "ddd " terminates a (possibly multi-line) reply;
                    // "ddd-" means more lines follow.
                    if trimmed.as_bytes()[3] == b' ' {
                        break;
                    }
                    continue;
                }
            }
            text.push_str(trimmed);
        }
        Ok(FtpResponse { code, text })
    }

    async fn command(&mut self, command: &str) -> Result<FtpResponse> {
        self.control
            .get_mut()
            .write_all(format!("{command}\r\n").as_bytes())
            .await
            .map_err(|e| ServiceError::TransientNetwork(format!("FTP control write: {e}")))?;
        self.read_response().await
    }

    async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let response = self.command(&format!("USER {user}")).await?;
        if response.code != 331 && response.code != 230 {
            return Err(ServiceError::Protocol(format!(
                "USER rejected: {} {}",
                response.code, response.text
            )));
        }
        if response.code == 331 {
            let response = self.command(&format!("PASS {password}")).await?;
            if response.code != 230 {
                return Err(ServiceError::Auth(format!(
                    "FTP login rejected: {} {}",
                    response.code, response.text
                )));
            }
        }

        // Binary transfers, protected data channel.
        self.command("TYPE I").await?;
        self.command("PBSZ 0").await?;
        let response = self.command("PROT P").await?;
        if response.code != 200 {
            return Err(ServiceError::Protocol(format!(
                "PROT P rejected: {} {}",
                response.code, response.text
            )));
        }
        Ok(())
    }

    /// Enter passive mode and return the data endpoint.
    async fn pasv(&mut self) -> Result<SocketAddr> {
        let response = self.command("PASV").await?;
        if response.code != 227 {
            return Err(ServiceError::Protocol(format!(
                "PASV rejected: {} {}",
                response.code, response.text
            )));
        }
        parse_pasv(&response.text, &self.host)
    }

    async fn open_data(&mut self, addr: SocketAddr) -> Result<TlsStream<TcpStream>> {
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ServiceError::TransientNetwork("FTP data connect timeout".into()))?
            .map_err(|e| ServiceError::TransientNetwork(format!("FTP data connect: {e}")))?;

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| ServiceError::Config(format!("invalid FTP host: {e}")))?;
        self.connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ServiceError::TransientNetwork(format!("FTP data TLS: {e}")))
    }

    async fn retr_to_file(&mut self, remote_path: &str, local_path: &Path) -> Result<u64> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data_addr = self.pasv().await?;
        let response = self.command(&format!("RETR {remote_path}")).await?;
        if response.code == 550 {
            return Err(ServiceError::NotFound(format!("{remote_path} on FTP")));
        }
        if response.code != 150 && response.code != 125 {
            return Err(ServiceError::Protocol(format!(
                "RETR rejected: {} {}",
                response.code, response.text
            )));
        }

        let mut data = self.open_data(data_addr).await?;
        let mut file = tokio::fs::File::create(local_path).await?;
        let mut buffer = vec![0u8; 8192];
        let mut written = 0u64;
        loop {
            let n = data
                .read(&mut buffer)
                .await
                .map_err(|e| ServiceError::TransientNetwork(format!("FTP data read: {e}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n]).await?;
            written += n as u64;
            if written % (1024 * 1024) < 8192 {
                tracing::debug!(remote_path, written, "FTP download progress");
            }
        }
        file.flush().await?;
        drop(data);

        let done = self.read_response().await?;
        if done.code != 226 {
            return Err(ServiceError::TransientNetwork(format!(
                "transfer incomplete: {} {}",
                done.code, done.text
            )));
        }
        Ok(written)
    }

    async fn list(&mut self, dir: &str) -> Result<Vec<RemoteFile>> {
        let data_addr = self.pasv().await?;
        let command = if dir.is_empty() {
            "LIST".to_string()
        } else {
            format!("LIST {dir}")
        };
        let response = self.command(&command).await?;
        if response.code != 150 && response.code != 125 {
            return Err(ServiceError::Protocol(format!(
                "LIST rejected: {} {}",
                response.code, response.text
            )));
        }

        let mut data = self.open_data(data_addr).await?;
        let mut raw = String::new();
        data.read_to_string(&mut raw)
            .await
            .map_err(|e| ServiceError::TransientNetwork(format!("FTP data read: {e}")))?;
        drop(data);

        let done = self.read_response().await?;
        if done.code != 226 {
            return Err(ServiceError::TransientNetwork(format!(
                "listing incomplete: {} {}",
                done.code, done.text
            )));
        }

        Ok(raw
            .lines()
            .filter_map(|line| parse_list_line(line, dir))
            .collect())
    }

    async fn quit(&mut self) {
        let _ = self.command("QUIT").await;
    }
}

fn parse_pasv(text: &str, control_host: &str) -> Result<SocketAddr> {
    let open = text
        .find('(')
        .ok_or_else(|| ServiceError::Protocol(format!("malformed PASV reply: {text}")))?;
    let close = text[open..]
        .find(')')
        .map(|i| open + i)
        .ok_or_else(|| ServiceError::Protocol(format!("malformed PASV reply: {text}")))?;
    let fields: Vec<u16> = text[open + 1..close]
        .split(',')
        .map(|p| p.trim().parse::<u16>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| ServiceError::Protocol(format!("malformed PASV reply: {text}")))?;
    if fields.len() != 6 {
        return Err(ServiceError::Protocol(format!("malformed PASV reply: {text}")));
    }
    let port = fields[4] * 256 + fields[5];
    // Printers frequently advertise 0.0.0.0 here; the control host is
    // the one that actually answers.
    let host = if fields[..4] == [0, 0, 0, 0] {
        control_host.to_string()
    } else {
        format!("{}.{}.{}.{}", fields[0], fields[1], fields[2], fields[3])
    };
    format!("{host}:{port}")
        .parse()
        .map_err(|_| ServiceError::Protocol(format!("bad PASV endpoint {host}:{port}")))
}

/// Parse one unix-style LIST line. Timestamps are best-effort; a line
/// whose date cannot be parsed still yields an entry.
fn parse_list_line(line: &str, dir: &str) -> Option<RemoteFile> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 9 {
        return None;
    }
    let permissions = tokens[0];
    if permissions.starts_with('d') {
        return None;
    }
    let size: u64 = tokens[4].parse().ok()?;
    let name = tokens[8..].join(" ");
    if name == "." || name == ".." {
        return None;
    }
    let modified = parse_list_date(tokens[5], tokens[6], tokens[7]);
    let path = if dir.is_empty() {
        name.clone()
    } else {
        format!("{dir}/{name}")
    };
    Some(RemoteFile {
        name,
        size,
        path,
        modified,
    })
}

fn parse_list_date(month: &str, day: &str, time_or_year: &str) -> Option<DateTime<Utc>> {
    const MONTHS: &[&str] = &[
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let month = MONTHS.iter().position(|m| m.eq_ignore_ascii_case(month))? as u32 + 1;
    let day: u32 = day.parse().ok()?;

    if let Some((h, m)) = time_or_year.split_once(':') {
        let hour: u32 = h.parse().ok()?;
        let minute: u32 = m.parse().ok()?;
        let date = NaiveDate::from_ymd_opt(Utc::now().year(), month, day)?;
        let dt = date.and_hms_opt(hour, minute, 0)?;
        Utc.from_utc_datetime(&dt).into()
    } else {
        let year: i32 = time_or_year.parse().ok()?;
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasv_reply_parses_host_and_port() {
        let addr =
            parse_pasv("Entering Passive Mode (192,168,1,50,217,24)", "192.168.1.50").unwrap();
        assert_eq!(addr.to_string(), "192.168.1.50:55576");
    }

    #[test]
    fn pasv_zero_host_falls_back_to_control_host() {
        let addr = parse_pasv("Entering Passive Mode (0,0,0,0,4,0)", "192.168.1.50").unwrap();
        assert_eq!(addr.to_string(), "192.168.1.50:1024");
    }

    #[test]
    fn malformed_pasv_is_a_protocol_error() {
        assert!(matches!(
            parse_pasv("no endpoint here", "h"),
            Err(ServiceError::Protocol(_))
        ));
    }

    #[test]
    fn list_line_parses_name_size_and_path() {
        let entry = parse_list_line(
            "-rw-r--r--   1 root  root     123456 Jan 15 10:30 Benchy v2.3mf",
            "cache",
        )
        .unwrap();
        assert_eq!(entry.name, "Benchy v2.3mf");
        assert_eq!(entry.size, 123456);
        assert_eq!(entry.path, "cache/Benchy v2.3mf");
        assert!(entry.modified.is_some());
    }

    #[test]
    fn directories_and_short_lines_are_skipped() {
        assert!(parse_list_line("drwxr-xr-x 2 root root 0 Jan 1 00:00 cache", "").is_none());
        assert!(parse_list_line("total 42", "").is_none());
    }

    #[test]
    fn year_form_dates_parse() {
        let entry =
            parse_list_line("-rw-r--r-- 1 root root 10 Mar 5 2024 old.gcode", "").unwrap();
        assert_eq!(
            entry.modified.unwrap().date_naive(),
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
        );
    }
}
