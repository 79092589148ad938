//! Byte sources that make up a dataset

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Something that can be opened for reading any number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    File(PathBuf),
    Memory { id: String, bytes: Arc<[u8]> },
}

impl Source {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Source::File(path.into())
    }

    pub fn memory(id: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Source::Memory {
            id: id.into(),
            bytes: bytes.into(),
        }
    }

    /// Human readable identifier used in logs and errors.
    pub fn id(&self) -> String {
        match self {
            Source::File(path) => path.display().to_string(),
            Source::Memory { id, .. } => id.clone(),
        }
    }

    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        match self {
            Source::File(path) => {
                let file = File::open(path).map_err(|error| Error::Io {
                    source_id: self.id(),
                    error,
                })?;
                Ok(Box::new(BufReader::new(file)))
            }
            Source::Memory { bytes, .. } => Ok(Box::new(Cursor::new(bytes.clone()))),
        }
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        match self {
            Source::File(path) => std::fs::read(path).map_err(|error| Error::Io {
                source_id: self.id(),
                error,
            }),
            Source::Memory { bytes, .. } => Ok(bytes.to_vec()),
        }
    }
}

impl From<PathBuf> for Source {
    fn from(path: PathBuf) -> Self {
        Source::File(path)
    }
}

impl From<&Path> for Source {
    fn from(path: &Path) -> Self {
        Source::File(path.to_path_buf())
    }
}

#[derive(Debug, Default, Clone)]
pub struct FileListOptions {
    /// Shell-style wildcard (`*`, `?`) matched against the whole path.
    pub pattern: Option<String>,
    pub predicate: Option<fn(&Path) -> bool>,
}

/// Expand files and directories into a dataset.
///
/// Directories are walked recursively following symlinks. Entries of each
/// directory come in natural order, so `img2.jpg` sorts before `img10.jpg`.
pub fn list_files<P: AsRef<Path>>(paths: &[P], opts: &FileListOptions) -> Result<Vec<Source>> {
    let mut sources = Vec::new();

    for root in paths {
        let root = root.as_ref();
        let walker = WalkDir::new(root).follow_links(true).sort_by(|a, b| {
            natural_cmp(&a.file_name().to_string_lossy(), &b.file_name().to_string_lossy())
        });

        for entry in walker {
            let entry = entry.map_err(|e| Error::Io {
                source_id: root.display().to_string(),
                error: e.into(),
            })?;

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            if let Some(pattern) = &opts.pattern {
                if !wildcard_match(pattern, &path.to_string_lossy()) {
                    continue;
                }
            }
            if let Some(predicate) = opts.predicate {
                if !predicate(path) {
                    continue;
                }
            }

            sources.push(Source::File(path.to_path_buf()));
        }
    }

    log::debug!("Listed {} files", sources.len());
    Ok(sources)
}

/// Compare strings treating runs of ASCII digits as numbers.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.as_bytes();
    let mut b = b.as_bytes();

    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let (na, rest_a) = split_digits(a);
                let (nb, rest_b) = split_digits(b);
                let na = trim_zeros(na);
                let nb = trim_zeros(nb);
                let ord = na.len().cmp(&nb.len()).then_with(|| na.cmp(nb));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = rest_a;
                b = rest_b;
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
    }
}

fn split_digits(s: &[u8]) -> (&[u8], &[u8]) {
    let end = s.iter().position(|c| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

fn trim_zeros(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|&c| c != b'0').unwrap_or(s.len());
    &s[start..]
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    // position of the last `*` and the text index it is currently matched up to
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}
