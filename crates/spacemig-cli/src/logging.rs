use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    sync::Arc,
};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

/// Logs go to stderr so `stats --json` output on stdout stays parseable. A non-blank
/// `log_dir` also appends them to `spacemig-<instance_id>.log` there.
///
/// `RUST_LOG` wins, then `debug`, then `SPACEMIG_LOG_LEVEL`, then `info`.
pub fn init_logging(debug: bool, log_dir: &str, instance_id: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_env("SPACEMIG_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"))
        }
    });

    let file = open_log_file(log_dir, instance_id).unwrap_or_else(|err| {
        eprintln!("log_file_error: {err}");
        None
    });
    let ansi = file.is_none();
    let writer = match file {
        Some(file) => BoxMakeWriter::new(io::stderr.and(Arc::new(file))),
        None => BoxMakeWriter::new(io::stderr),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_writer(writer)
        .try_init();
}

fn open_log_file(log_dir: &str, instance_id: &str) -> io::Result<Option<File>> {
    let log_dir = log_dir.trim();
    if log_dir.is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(log_dir)?;
    let path = Path::new(log_dir).join(format!("spacemig-{instance_id}.log"));
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn log_file_is_created_per_instance_and_appended() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_dir = dir.path().join("logs");
        let log_dir = log_dir.to_str().expect("utf8 path");

        let mut file = open_log_file(log_dir, "inst-1")
            .expect("open log")
            .expect("file enabled");
        file.write_all(b"first\n").expect("write");
        let mut again = open_log_file(log_dir, "inst-1")
            .expect("reopen log")
            .expect("file enabled");
        again.write_all(b"second\n").expect("write");

        let content = std::fs::read_to_string(Path::new(log_dir).join("spacemig-inst-1.log"))
            .expect("read log");
        assert_eq!(content, "first\nsecond\n");
    }

    #[test]
    fn blank_log_dir_disables_file() {
        assert!(open_log_file("  ", "inst-1").expect("open log").is_none());
    }
}
