//! Plumbing shared by sandbox implementations: in-memory tar packing,
//! output capping and diagnostics sanitization.

use bytes::{Bytes, BytesMut};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_tar::Header;

/// Pack a set of in-memory files into a tar stream suitable for
/// `upload_to_container`. The archive is produced on a separate task and
/// piped through a duplex buffer so large artifacts never sit in memory
/// twice.
pub fn tar_with_files(
    files: impl Iterator<Item = (String, Bytes)> + Send + 'static,
) -> (
    impl Stream<Item = Result<BytesMut, std::io::Error>> + 'static,
    JoinHandle<Result<(), std::io::Error>>,
) {
    let (pipe_recv, pipe_send) = tokio::io::duplex(8192);
    let read_codec = tokio_util::codec::BytesCodec::new();
    let frame = tokio_util::codec::FramedRead::new(pipe_send, read_codec);

    let archiving = tokio::spawn(async move {
        let mut tar = tokio_tar::Builder::new(pipe_recv);
        for (name, file) in files {
            let mut header = Header::new_gnu();
            header.set_path(name)?;
            header.set_mode(0o755);
            header.set_size(file.len() as u64);
            header.set_cksum();
            tar.append(&header, &*file).await?;
        }
        tar.finish().await
    });

    (frame, archiving)
}

/// Whether a bollard stream error can be skipped over without aborting the
/// whole run. Transient JSON/parse hiccups in the event stream are; broken
/// transports are not.
pub fn is_recoverable_error(e: &bollard::errors::Error) -> bool {
    matches!(
        &e,
        bollard::errors::Error::JsonDataError { .. }
            | bollard::errors::Error::JsonSerdeError { .. }
            | bollard::errors::Error::StrParseError { .. }
            | bollard::errors::Error::StrFmtError { .. }
            | bollard::errors::Error::URLEncodedError { .. }
    )
}

/// A byte buffer that silently stops growing past `size_limit`, remembering
/// that it overflowed. Protects the judge against output flooding.
pub struct CappedBuffer {
    size_limit: usize,
    bytes: BytesMut,
    overflowed: bool,
}

impl CappedBuffer {
    pub fn new(size_limit: usize) -> Self {
        CappedBuffer {
            size_limit,
            bytes: BytesMut::new(),
            overflowed: false,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        if self.bytes.len() >= self.size_limit {
            if !bytes.is_empty() {
                self.overflowed = true;
            }
        } else if self.bytes.len() + bytes.len() > self.size_limit {
            let cut_at = self.size_limit - self.bytes.len();
            self.bytes.extend_from_slice(&bytes[0..cut_at]);
            self.overflowed = true;
        } else {
            self.bytes.extend_from_slice(bytes);
        }
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Keep only the tail of a diagnostic string, on a char boundary. Submitters
/// get excerpts, never unbounded logs.
pub fn tail_excerpt(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &s[start..])
}

/// Human-readable name for the handful of signals a judged program usually
/// dies from.
pub fn signal_name(signal: i64) -> &'static str {
    match signal {
        4 => "SIGILL",
        6 => "SIGABRT",
        8 => "SIGFPE",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        15 => "SIGTERM",
        24 => "SIGXCPU",
        25 => "SIGXFSZ",
        _ => "unknown signal",
    }
}

/// Convert the 128+n exit codes shells report for signal deaths into the
/// signal number; other codes pass through as-is.
pub fn exit_signal(code: i64) -> Option<i64> {
    if (129..=254).contains(&code) {
        Some(code - 128)
    } else {
        None
    }
}
