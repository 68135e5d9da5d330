//! Preview/edit/image gating: extension allowlists and byte caps.

pub const PREVIEW_MAX_BYTES: u64 = 200 * 1024;
pub const EDIT_MAX_BYTES: u64 = 1024 * 1024;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "json", "yaml", "yml", "toml", "xml", "csv", "tsv",
    "log", "ini", "conf", "cfg", "env", "sh", "bash", "py", "rs", "js", "ts",
    "jsx", "tsx", "css", "scss", "html", "htm", "sql", "properties",
];

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "bmp", "svg", "ico", "avif",
];

pub fn extension_of(name: &str) -> Option<String> {
    let dot = name.rfind('.')?;
    if dot == 0 || dot + 1 == name.len() {
        return None;
    }
    Some(name[dot + 1..].to_ascii_lowercase())
}

/// Text preview is allowed for a known text extension only.
pub fn is_previewable(name: &str) -> bool {
    matches!(extension_of(name), Some(ext) if TEXT_EXTENSIONS.contains(&ext.as_str()))
}

/// The in-browser editor accepts the same extensions preview does.
pub fn is_editable(name: &str) -> bool {
    is_previewable(name)
}

pub fn is_image(name: &str) -> bool {
    matches!(extension_of(name), Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Binary heuristic used by preview and search: a NUL anywhere in the
/// scanned window marks the content as binary.
pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes.contains(&0)
}

pub fn image_mime(name: &str) -> &'static str {
    match extension_of(name).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("avif") => "image/avif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_extraction() {
        assert_eq!(extension_of("notes.txt").as_deref(), Some("txt"));
        assert_eq!(extension_of("archive.tar.GZ").as_deref(), Some("gz"));
        assert_eq!(extension_of(".hidden"), None);
        assert_eq!(extension_of("trailing."), None);
        assert_eq!(extension_of("noext"), None);
    }

    #[test]
    fn gating() {
        assert!(is_previewable("readme.MD"));
        assert!(is_editable("config.toml"));
        assert!(!is_previewable("movie.mp4"));
        assert!(!is_editable("blob.bin"));
        assert!(is_image("photo.JPEG"));
        assert!(!is_image("photo.txt"));
    }

    #[test]
    fn binary_detection() {
        assert!(!looks_binary(b"plain text"));
        assert!(looks_binary(b"pre\0post"));
    }

    #[test]
    fn image_mime_mapping() {
        assert_eq!(image_mime("a.png"), "image/png");
        assert_eq!(image_mime("b.JPG"), "image/jpeg");
        assert_eq!(image_mime("c.svg"), "image/svg+xml");
        assert_eq!(image_mime("d.unknown"), "application/octet-stream");
    }
}
