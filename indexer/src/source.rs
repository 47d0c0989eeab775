//! Reads comment archives (JSON arrays or JSON lines) from a directory tree
//! and turns each comment into a normalized `Document`.

use anyhow::{anyhow, Context, Result};
use rq_core::index::parse_base36;
use rq_core::{DocId, Document, Normalizer};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct InputComment {
    id: RawId,
    body: String,
}

type Comments = Box<dyn Iterator<Item = Result<InputComment>>>;

/// Archive files under `input`, sorted so repeated builds see the same order.
pub fn archive_files(input: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();
    if input.is_dir() {
        for entry in WalkDir::new(input).into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_file() {
                if let Some(ext) = p.extension().and_then(|s| s.to_str()) {
                    if matches!(ext, "json" | "jsonl") {
                        files.push(p.to_path_buf());
                    }
                }
            }
        }
    } else if input.is_file() {
        files.push(input.to_path_buf());
    }
    files.sort();
    files
}

pub struct CommentSource<N> {
    files: std::vec::IntoIter<PathBuf>,
    current: Option<Comments>,
    normalizer: N,
    fulltext: bool,
    failed: bool,
}

impl<N: Normalizer> CommentSource<N> {
    pub fn new(files: Vec<PathBuf>, normalizer: N, fulltext: bool) -> Self {
        Self { files: files.into_iter(), current: None, normalizer, fulltext, failed: false }
    }

    fn to_document(&self, comment: InputComment) -> Result<Document> {
        let (id, name): (DocId, String) = match comment.id {
            RawId::Number(n) => (n, n.to_string()),
            RawId::Text(s) => {
                let id = parse_base36(&s).ok_or_else(|| anyhow!("unrecognized comment id {s:?}"))?;
                (id, s)
            }
        };
        let tokens = self.normalizer.normalize(&comment.body);
        let document = Document::new(id, tokens).with_name(name);
        Ok(if self.fulltext { document.with_text(comment.body) } else { document })
    }
}

impl<N: Normalizer> Iterator for CommentSource<N> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(comments) = self.current.as_mut() {
                match comments.next() {
                    Some(Ok(comment)) => {
                        let document = self.to_document(comment);
                        self.failed = document.is_err();
                        return Some(document);
                    }
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }
            let file = self.files.next()?;
            tracing::info!(file = %file.display(), "reading archive");
            match open_archive(&file) {
                Ok(comments) => self.current = Some(comments),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn open_archive(file: &Path) -> Result<Comments> {
    let f = File::open(file).with_context(|| format!("opening {}", file.display()))?;
    let reader = BufReader::new(f);
    if file.extension().and_then(|s| s.to_str()) == Some("jsonl") {
        let name = file.display().to_string();
        let lines = reader.lines().enumerate().filter_map(move |(i, line)| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(
                serde_json::from_str::<InputComment>(&line).with_context(|| format!("{name}:{}", i + 1)),
            ),
            Err(e) => Some(Err(anyhow::Error::new(e).context(format!("{name}:{}", i + 1)))),
        });
        return Ok(Box::new(lines));
    }
    let json: serde_json::Value =
        serde_json::from_reader(reader).with_context(|| format!("parsing {}", file.display()))?;
    let comments: Vec<InputComment> = match json {
        serde_json::Value::Array(arr) => {
            arr.into_iter().map(serde_json::from_value).collect::<Result<Vec<_>, _>>()?
        }
        serde_json::Value::Object(_) => vec![serde_json::from_value(json)?],
        _ => Vec::new(),
    };
    Ok(Box::new(comments.into_iter().map(Ok)))
}
