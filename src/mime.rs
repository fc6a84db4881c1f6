//! Extension to content-type mapping.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/json        json",
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/xml         xsl xml",
    "application/xml-dtd     dtd",
    "application/xslt+xml    xslt",
    "application/zip         zip",
    "audio/flac              flac",
    "audio/mpeg              mp2 mp3 mpga",
    "audio/ogg               ogg opus oga spx",
    "audio/wav               wav",
    "audio/x-m4a             m4a",
    "font/woff               woff",
    "font/woff2              woff2",
    "image/apng              apng",
    "image/avif              avif",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "image/webp              webp",
    "text/css                css",
    "text/html               html htm",
    "text/javascript         js",
    "text/plain              txt asc",
    "video/mpeg              mpeg mpe mpg",
    "video/quicktime         qt mov",
    "video/webm              webm",
    "video/x-msvideo         avi",
    "video/mp4               mp4 m4v",
];

#[derive(Debug, Clone)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    default_mimetype: String,
}

impl MimeMap {
    /// Add extension map from a file.
    pub fn parse_extension_map_file(&mut self, filename: &Path) -> Result<()> {
        let file = File::open(filename)
            .with_context(|| format!("failed to open {}", filename.display()))?;
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("failed to read {}", filename.display()))?;
            self.add_mimetype_line(&line);
        }
        Ok(())
    }

    /// Add a line like `text/html html htm`. A colon after the type is allowed.
    pub fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c: char| c.is_ascii_whitespace())
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype.trim_end_matches(':'),
            None => return, // empty line
        };
        if mimetype.starts_with('#') || mimetype.is_empty() {
            return; // comment
        }
        for extension in fields {
            self.mimetypes
                .insert(extension.to_string(), mimetype.to_string());
        }
    }

    pub fn set_default_mimetype(&mut self, mimetype: &str) {
        self.default_mimetype = mimetype.to_string();
    }

    /// Content type for a file name or URL path.
    pub fn content_type(&self, name: &[u8]) -> &str {
        let basename = match name.iter().rposition(|&b| b == b'/') {
            Some(slash) => &name[slash + 1..],
            None => name,
        };
        basename
            .iter()
            .rposition(|&b| b == b'.')
            .and_then(|dot| std::str::from_utf8(&basename[dot + 1..]).ok())
            .and_then(|extension| {
                self.mimetypes
                    .get(extension)
                    .or_else(|| self.mimetypes.get(&extension.to_ascii_lowercase()))
            })
            .unwrap_or(&self.default_mimetype)
    }
}

impl Default for MimeMap {
    /// Create MimeMap using the default extension map.
    fn default() -> Self {
        let mut mime_map = Self {
            mimetypes: HashMap::new(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }
}
