//! PostgreSQL Admin Tools
//!
//! Drives the database's control binaries (`initdb`, `pg_ctl`,
//! `pg_basebackup`, `pg_rewind`, `pg_controldata`) as supervised child
//! processes. Every operation checks its pre-condition first so a keeper
//! killed mid-transition can safely re-run the same step.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::SslConfig;
use crate::error::{Error, Result};

/// pg_ctl status exit code for "no server running"
const PG_CTL_STATUS_NOT_RUNNING: i32 = 3;

/// Driver for the PostgreSQL admin binaries
#[derive(Debug, Clone)]
pub struct PgCtl {
    /// Directory holding the binaries (PATH lookup when None)
    bindir: Option<PathBuf>,
    /// Data directory of the managed instance
    pgdata: PathBuf,
    /// Port the managed instance listens on
    port: u16,
}

impl PgCtl {
    /// Create a new admin-tool driver
    pub fn new(bindir: Option<PathBuf>, pgdata: PathBuf, port: u16) -> Self {
        Self {
            bindir,
            pgdata,
            port,
        }
    }

    /// Data directory this driver manages
    pub fn pgdata(&self) -> &Path {
        &self.pgdata
    }

    fn tool(&self, name: &str) -> PathBuf {
        match &self.bindir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Run a tool, capturing output; non-zero exit becomes an error
    async fn run(&self, name: &str, args: &[&str]) -> Result<String> {
        let path = self.tool(name);
        tracing::debug!("running {} {}", path.display(), args.join(" "));

        let output = Command::new(&path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            match output.status.code() {
                Some(code) => Err(Error::PgCommand {
                    tool: name.to_string(),
                    code,
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                }),
                None => Err(Error::PgCommandKilled {
                    tool: name.to_string(),
                }),
            }
        }
    }

    /// Whether PGDATA exists and contains a cluster
    pub fn pgdata_exists(&self) -> bool {
        self.pgdata.join("PG_VERSION").exists()
    }

    /// Initialize a new cluster; no-op when PGDATA already holds one
    pub async fn initdb(&self) -> Result<()> {
        if self.pgdata_exists() {
            tracing::debug!("PGDATA {} already initialized", self.pgdata.display());
            return Ok(());
        }
        std::fs::create_dir_all(&self.pgdata)?;
        let pgdata = self.pgdata.to_string_lossy().into_owned();
        self.run(
            "initdb",
            &["--pgdata", &pgdata, "--auth-local", "trust", "--auth-host", "trust"],
        )
        .await?;
        Ok(())
    }

    /// Whether the server is currently running
    pub async fn is_running(&self) -> Result<bool> {
        let pgdata = self.pgdata.to_string_lossy().into_owned();
        let path = self.tool("pg_ctl");
        let output = Command::new(&path)
            .args(["status", "--pgdata", &pgdata])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await?;

        match output.status.code() {
            Some(0) => Ok(true),
            Some(PG_CTL_STATUS_NOT_RUNNING) => Ok(false),
            // 4 = no accessible data directory: not running
            Some(4) => Ok(false),
            Some(code) => Err(Error::PgCommand {
                tool: "pg_ctl".to_string(),
                code,
                stderr: "pg_ctl status failed".to_string(),
            }),
            None => Err(Error::PgCommandKilled {
                tool: "pg_ctl".to_string(),
            }),
        }
    }

    /// Start the server and wait for it to accept connections
    pub async fn start(&self) -> Result<()> {
        if self.is_running().await? {
            return Ok(());
        }
        let pgdata = self.pgdata.to_string_lossy().into_owned();
        let options = format!("-p {}", self.port);
        let log = self.pgdata.join("startup.log").to_string_lossy().into_owned();
        self.run(
            "pg_ctl",
            &[
                "start", "--pgdata", &pgdata, "--wait", "--timeout", "60", "--log", &log, "-o",
                &options,
            ],
        )
        .await?;
        Ok(())
    }

    /// Stop the server with a fast shutdown; no-op when already stopped
    pub async fn stop(&self) -> Result<()> {
        if !self.is_running().await? {
            return Ok(());
        }
        let pgdata = self.pgdata.to_string_lossy().into_owned();
        self.run(
            "pg_ctl",
            &["stop", "--pgdata", &pgdata, "--wait", "--mode", "fast"],
        )
        .await?;
        Ok(())
    }

    /// Restart the server
    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Signal the server to reload its configuration
    pub async fn reload(&self) -> Result<()> {
        let pgdata = self.pgdata.to_string_lossy().into_owned();
        self.run("pg_ctl", &["reload", "--pgdata", &pgdata]).await?;
        Ok(())
    }

    /// Promote a standby and wait for recovery to end
    pub async fn promote(&self) -> Result<()> {
        let pgdata = self.pgdata.to_string_lossy().into_owned();
        self.run("pg_ctl", &["promote", "--pgdata", &pgdata, "--wait"])
            .await?;
        Ok(())
    }

    /// Take a base backup from the upstream into the backup directory,
    /// then move it into place as the new PGDATA
    pub async fn basebackup(
        &self,
        upstream_conninfo: &str,
        slot_name: &str,
        backup_dir: &Path,
        max_rate: Option<&str>,
    ) -> Result<()> {
        if backup_dir.exists() {
            std::fs::remove_dir_all(backup_dir)?;
        }
        std::fs::create_dir_all(backup_dir)?;

        let target = backup_dir.to_string_lossy().into_owned();
        let mut args: Vec<String> = vec![
            "--pgdata".into(),
            target,
            "--wal-method=stream".into(),
            "--checkpoint=fast".into(),
            "--progress".into(),
            format!("--slot={slot_name}"),
            format!("--dbname={upstream_conninfo}"),
        ];
        if let Some(rate) = max_rate {
            args.push(format!("--max-rate={rate}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.run("pg_basebackup", &arg_refs).await?;

        // Swap the fresh copy into place
        if self.pgdata.exists() {
            std::fs::remove_dir_all(&self.pgdata)?;
        }
        std::fs::rename(backup_dir, &self.pgdata)?;
        Ok(())
    }

    /// Rewind PGDATA to follow the given source server. The server must be
    /// stopped. Returns the admin-tool error on refusal so the caller can
    /// fall back to a full base backup.
    pub async fn rewind(&self, source_conninfo: &str) -> Result<()> {
        let pgdata = self.pgdata.to_string_lossy().into_owned();
        let source = format!("--source-server={source_conninfo}");
        self.run(
            "pg_rewind",
            &["--target-pgdata", &pgdata, &source, "--progress"],
        )
        .await?;
        Ok(())
    }

    /// Read the cluster's system identifier from the control file
    pub async fn system_identifier(&self) -> Result<u64> {
        let pgdata = self.pgdata.to_string_lossy().into_owned();
        let output = self.run("pg_controldata", &[pgdata.as_str()]).await?;
        parse_system_identifier(&output)
    }

    /// Write self-signed TLS material into PGDATA using the openssl tool
    pub async fn write_self_signed_cert(&self, hostname: &str) -> Result<(PathBuf, PathBuf)> {
        let cert = self.pgdata.join("server.crt");
        let key = self.pgdata.join("server.key");
        if cert.exists() && key.exists() {
            return Ok((cert, key));
        }

        let subj = format!("/CN={hostname}");
        let cert_s = cert.to_string_lossy().into_owned();
        let key_s = key.to_string_lossy().into_owned();
        let output = Command::new("openssl")
            .args([
                "req", "-new", "-x509", "-days", "365", "-nodes", "-text", "-subj", &subj,
                "-out", &cert_s, "-keyout", &key_s,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::PgCommand {
                tool: "openssl".to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // Postgres refuses group/world-readable server keys
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok((cert, key))
    }

    /// SSL settings for the managed server derived from the posture config
    pub fn ssl_settings(&self, ssl: &SslConfig) -> Vec<(String, String)> {
        let mut settings = Vec::new();
        if ssl.mode == "disable" {
            settings.push(("ssl".to_string(), "off".to_string()));
            return settings;
        }
        settings.push(("ssl".to_string(), "on".to_string()));
        if let Some(cert) = &ssl.server_cert {
            settings.push(("ssl_cert_file".to_string(), format!("'{}'", cert.display())));
        }
        if let Some(key) = &ssl.server_key {
            settings.push(("ssl_key_file".to_string(), format!("'{}'", key.display())));
        }
        if let Some(ca) = &ssl.ca_file {
            settings.push(("ssl_ca_file".to_string(), format!("'{}'", ca.display())));
        }
        if let Some(crl) = &ssl.crl_file {
            settings.push(("ssl_crl_file".to_string(), format!("'{}'", crl.display())));
        }
        settings
    }
}

/// Extract the system identifier from pg_controldata output
fn parse_system_identifier(controldata: &str) -> Result<u64> {
    for line in controldata.lines() {
        if let Some(rest) = line.strip_prefix("Database system identifier:") {
            return rest
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::StateFile(format!("bad system identifier: {}", rest.trim())));
        }
    }
    Err(Error::StateFile(
        "pg_controldata output has no system identifier".to_string(),
    ))
}

/// Wait until a predicate holds or the deadline passes
pub async fn wait_until<F, Fut>(deadline: Duration, interval: Duration, mut check: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let started = std::time::Instant::now();
    loop {
        if check().await? {
            return Ok(true);
        }
        if started.elapsed() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_system_identifier() {
        let output = "\
pg_control version number:            1300
Catalog version number:               202107181
Database system identifier:           7015282526388021354
Database cluster state:               in production
";
        assert_eq!(parse_system_identifier(output).unwrap(), 7015282526388021354);
    }

    #[test]
    fn test_parse_system_identifier_missing() {
        assert!(parse_system_identifier("Database cluster state: shut down").is_err());
    }

    #[test]
    fn test_pgdata_exists_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = PgCtl::new(None, dir.path().to_path_buf(), 5432);
        assert!(!ctl.pgdata_exists());
        std::fs::write(dir.path().join("PG_VERSION"), "14\n").unwrap();
        assert!(ctl.pgdata_exists());
    }

    #[tokio::test]
    async fn test_wait_until_deadline() {
        let result = wait_until(
            Duration::from_millis(50),
            Duration::from_millis(10),
            || async { Ok(false) },
        )
        .await
        .unwrap();
        assert!(!result);

        let result = wait_until(
            Duration::from_millis(50),
            Duration::from_millis(10),
            || async { Ok(true) },
        )
        .await
        .unwrap();
        assert!(result);
    }
}
