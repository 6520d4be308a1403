use std::fs;
use std::io::{ErrorKind, Write as _};
use std::path::Path;

use serde::Deserialize;

use crate::sandbox::{Error, Result};

pub trait WithTimeout {
    type Output;
    fn with_timeout(
        self,
        t: std::time::Duration,
    ) -> impl std::future::Future<Output = Option<Self::Output>> + Send;
}

impl<F: std::future::Future + Send> WithTimeout for F {
    type Output = F::Output;
    async fn with_timeout(self, t: std::time::Duration) -> Option<Self::Output> {
        tokio::time::timeout(t, self).await.ok()
    }
}

/// Writes `contents` to a sibling temp file and renames it over `path`,
/// so readers only ever see the complete value.
pub fn write_atomic(path: &Path, contents: impl AsRef<[u8]>) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(contents.as_ref())?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

/// Reads a pidfile written by the runtime or the shim. A trailing newline is tolerated.
pub fn read_pid_file(path: &Path) -> Result<i32> {
    let contents = fs::read_to_string(path)?;
    parse_pid(path, &contents)
}

/// Like [`read_pid_file`] but a missing or still empty file is `Ok(None)`.
pub fn try_read_pid_file(path: &Path) -> Result<Option<i32>> {
    match fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => Ok(None),
        Ok(contents) => parse_pid(path, &contents).map(Some),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_pid(path: &Path, contents: &str) -> Result<i32> {
    match contents.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(Error::PidFile(format!(
            "{}: {contents:?} is not a pid",
            path.display()
        ))),
    }
}

/// Ensures `value` can be used as a single directory name.
pub fn validate_name(kind: &str, value: &str) -> Result<()> {
    let invalid = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains('/')
        || value.contains('\0');
    if invalid {
        return Err(Error::InvalidArgument(format!("invalid {kind} {value:?}")));
    }
    Ok(())
}

#[derive(Deserialize)]
struct LogMessage {
    #[serde(default)]
    level: String,
    #[serde(default, alias = "message")]
    msg: String,
}

/// Collects error-level messages from a JSON-lines log written by the shim or the runtime.
/// Unreadable files and malformed trailing lines are ignored.
pub fn read_log_errors(path: &Path) -> Vec<String> {
    let Ok(file) = fs::File::open(path) else {
        return vec![];
    };
    serde_json::Deserializer::from_reader(std::io::BufReader::new(file))
        .into_iter::<LogMessage>()
        .map_while(|msg| msg.ok())
        .filter(|msg| msg.level == "error")
        .map(|msg| msg.msg)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_with_timeout() {
        let res = std::future::pending::<()>()
            .with_timeout(Duration::from_millis(1))
            .await;
        assert_eq!(res, None);
        let res = async { 3 }.with_timeout(Duration::from_secs(1)).await;
        assert_eq!(res, Some(3));
    }

    #[test]
    fn test_pid_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("pid");

        assert!(try_read_pid_file(&path)?.is_none());

        fs::write(&path, "")?;
        assert!(try_read_pid_file(&path)?.is_none());

        fs::write(&path, "1234\n")?;
        assert_eq!(read_pid_file(&path)?, 1234);
        assert_eq!(try_read_pid_file(&path)?, Some(1234));

        fs::write(&path, "12ab")?;
        assert!(matches!(read_pid_file(&path), Err(Error::PidFile(_))));
        assert!(matches!(try_read_pid_file(&path), Err(Error::PidFile(_))));

        fs::write(&path, "-5")?;
        assert!(matches!(read_pid_file(&path), Err(Error::PidFile(_))));
        Ok(())
    }

    #[test]
    fn test_write_atomic_replaces() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("exitStatus");
        write_atomic(&path, "1")?;
        write_atomic(&path, "143")?;
        assert_eq!(fs::read_to_string(&path)?, "143");
        assert!(!dir.path().join("exitStatus.tmp").exists());
        Ok(())
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("id", "c1").is_ok());
        assert!(validate_name("id", "").is_err());
        assert!(validate_name("id", "..").is_err());
        assert!(validate_name("id", "a/b").is_err());
    }

    #[test]
    fn test_read_log_errors() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("log.json");
        fs::write(
            &path,
            concat!(
                "{\"level\":\"info\",\"msg\":\"starting\"}\n",
                "{\"level\":\"error\",\"msg\":\"exec failed\"}\n",
                "{\"level\":\"err"
            ),
        )?;
        assert_eq!(read_log_errors(&path), vec!["exec failed".to_string()]);
        assert!(read_log_errors(&dir.path().join("missing")).is_empty());
        Ok(())
    }
}
