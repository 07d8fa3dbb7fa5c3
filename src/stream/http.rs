//! Minimal HTTP/1.1 surface for the media streamer: request parsing, byte
//! ranges, response heads and MIME lookup. Only what a media player needs
//! for seekable playback.

/// `Range: bytes=<start>-[<end>]` as sent by the client, before validation
/// against the file size. `end` is inclusive; `None` means "to end of file".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub range: Option<RangeSpec>,
}

/// Parse a request head (everything up to the blank line). Returns `None`
/// when the request line is malformed.
pub fn parse_request(head: &str) -> Option<HttpRequest> {
    let mut lines = head.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    parts.next()?; // HTTP version

    let mut range = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                range = parse_range(value.trim());
            }
        }
    }

    Some(HttpRequest {
        method,
        target,
        range,
    })
}

/// Parse a `bytes=start-[end]` range value. Malformed values are ignored
/// (the full file is served), matching lenient server behavior; out-of-bound
/// values are caught later by [`resolve_range`].
fn parse_range(value: &str) -> Option<RangeSpec> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;

    let start: u64 = start.trim().parse().ok()?;
    let end = end.trim();
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };

    Some(RangeSpec { start, end })
}

/// Inclusive, validated byte span within a file of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
}

impl ResolvedRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Validate a requested range against the file size. `None` means the range
/// is not satisfiable (416). An `end` past EOF is clamped to `size - 1`.
pub fn resolve_range(spec: RangeSpec, size: u64) -> Option<ResolvedRange> {
    if size == 0 || spec.start >= size {
        return None;
    }
    let end = spec.end.map_or(size - 1, |e| e.min(size - 1));
    if spec.start > end {
        return None;
    }
    Some(ResolvedRange {
        start: spec.start,
        end,
    })
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        404 => "Not Found",
        405 => "Method Not Allowed",
        416 => "Range Not Satisfiable",
        _ => "Internal Server Error",
    }
}

/// Content type by file extension; unknown extensions map to a generic
/// binary type.
pub fn mime_type(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".mp4") || lower.ends_with(".m4v") {
        "video/mp4"
    } else if lower.ends_with(".mov") {
        "video/quicktime"
    } else if lower.ends_with(".avi") {
        "video/x-msvideo"
    } else if lower.ends_with(".mkv") {
        "video/x-matroska"
    } else {
        "application/octet-stream"
    }
}

/// Build a response head. `content_range` is `(start, end, size)` for 206
/// responses. Every response advertises byte-range support and closes the
/// connection after the body.
pub fn response_head(
    status: u16,
    content_type: &str,
    content_length: u64,
    content_range: Option<(u64, u64, u64)>,
) -> String {
    let mut head = format!("HTTP/1.1 {status} {}\r\n", status_text(status));
    if let Some((start, end, size)) = content_range {
        head.push_str(&format!("Content-Range: bytes {start}-{end}/{size}\r\n"));
    }
    head.push_str("Accept-Ranges: bytes\r\n");
    head.push_str(&format!("Content-Length: {content_length}\r\n"));
    head.push_str(&format!("Content-Type: {content_type}\r\n"));
    head.push_str("Connection: close\r\n");
    head.push_str("Cache-Control: no-cache\r\n");
    head.push_str("\r\n");
    head
}
