//! File extension → MIME type table.

/// Extensions the server recognizes. Anything else is served as
/// `application/octet-stream`.
const MIME_TABLE: &[(&str, &str)] = &[
    ("css", "text/css"),
    ("csv", "text/csv"),
    ("eot", "application/vnd.ms-fontobject"),
    ("gif", "image/gif"),
    ("gz", "application/gzip"),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("ico", "image/x-icon"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("js", "text/javascript"),
    ("json", "application/json"),
    ("md", "text/markdown"),
    ("mjs", "text/javascript"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("ogg", "audio/ogg"),
    ("otf", "font/otf"),
    ("pdf", "application/pdf"),
    ("png", "image/png"),
    ("svg", "image/svg+xml"),
    ("ttf", "font/ttf"),
    ("txt", "text/plain"),
    ("wav", "audio/wav"),
    ("webm", "video/webm"),
    ("webp", "image/webp"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("xml", "application/xml"),
    ("yaml", "application/yaml"),
    ("yml", "application/yaml"),
    ("zip", "application/zip"),
];

/// MIME type for a bare extension, if recognized.
pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    let ext = ext.to_ascii_lowercase();
    MIME_TABLE
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

/// MIME type for a path, defaulting to `application/octet-stream`.
pub fn mime_for_path(path: &str) -> &'static str {
    path.rsplit('.')
        .next()
        .and_then(mime_for_extension)
        .unwrap_or("application/octet-stream")
}

/// Whether `value` looks like a literal MIME type.
pub fn is_mime_type(value: &str) -> bool {
    match value.split_once('/') {
        Some((kind, subtype)) => {
            matches!(
                kind,
                "application" | "audio" | "font" | "image" | "text" | "video"
            ) && !subtype.is_empty()
                && !subtype.contains(char::is_whitespace)
        }
        None => false,
    }
}
