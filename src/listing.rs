//! Generated directory listings.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Local};

use crate::url::{HtmlEscaped, UrlEncoded};

/// One row of a listing.
#[derive(Debug)]
struct Entry {
    name: OsString,
    is_dir: bool,
    modified: Option<SystemTime>,
    size: u64,
}

/// Listing rows, sorted by name.
struct Listing(Vec<Entry>);

impl Listing {
    fn read(path: &Path) -> io::Result<Self> {
        let mut entries = Vec::new();
        for dir_entry in std::fs::read_dir(path)? {
            let dir_entry = match dir_entry {
                Ok(dir_entry) => dir_entry,
                Err(_) => continue,
            };
            // stat, not lstat: links are listed as what they point to
            let metadata = match std::fs::metadata(dir_entry.path()) {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            entries.push(Entry {
                name: dir_entry.file_name(),
                is_dir: metadata.is_dir(),
                modified: metadata.modified().ok(),
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        Ok(Self(entries))
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "<tr><td><a href=\"..\">..</a>/</td><td></td><td></td></tr>")?;
        for entry in &self.0 {
            let name = entry.name.to_string_lossy();
            let slash = if entry.is_dir { "/" } else { "" };
            write!(
                f,
                "<tr><td><a href=\"{}{}\">{}</a>{}</td><td>",
                UrlEncoded(entry.name.as_bytes()),
                slash,
                HtmlEscaped(&name),
                slash,
            )?;
            if let Some(modified) = entry.modified {
                let datetime = DateTime::<Local>::from(modified);
                write!(f, "{}", datetime.format("%Y-%m-%d %H:%M"))?;
            }
            f.write_str("</td><td>")?;
            if !entry.is_dir {
                write!(f, "{}", entry.size)?;
            }
            writeln!(f, "</td></tr>")?;
        }
        Ok(())
    }
}

/// HTML page listing the directory at `path`, titled with the decoded URL.
///
/// `footer` goes under the table, eg. a "Generated by" line.
pub fn generate(path: &Path, decoded_url: &[u8], footer: &str) -> io::Result<String> {
    let listing = Listing::read(path)?;
    let title = String::from_utf8_lossy(decoded_url);
    Ok(format!(
        "<html>\n<head>\n<title>{}</title>\n\
        <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
        </head>\n<body>\n<h1>{}</h1>\n\
        <table>\n\
        {}\
        </table>\n\
        <hr>\n\
        {}\
        </body>\n</html>\n",
        HtmlEscaped(&title),
        HtmlEscaped(&title),
        listing,
        footer,
    ))
}
