//! Helpers for logging untrusted worker output.

/// Maximum number of bytes of a worker line echoed into a log event.
pub const PREVIEW_BYTES: usize = 200;

/// Find the largest byte index <= `i` that is on a UTF-8 char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    // Walk backwards while we're at a continuation byte (0b10xxxxxx)
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Shorten a line of worker output for a log event.
///
/// Lines longer than `max_bytes` are cut on a char boundary and suffixed
/// with `...` and the number of bytes omitted.
pub fn preview(line: &str, max_bytes: usize) -> String {
    if line.len() <= max_bytes {
        return line.to_string();
    }
    let cut = floor_char_boundary(line, max_bytes);
    format!("{}... ({} more bytes)", &line[..cut], line.len() - cut)
}
