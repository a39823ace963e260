//! Structured documents
//!
//! A small block-based document model (headings, paragraphs, lists, tables)
//! that renders deterministically to LaTeX. Producers that cannot be trusted
//! to write valid LaTeX, such as generated JSON, go through this path instead
//! of submitting raw source.

mod latex;

pub use latex::{latex_escape, render_document, PREAMBLE};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured document validation errors
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid document JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("document title is empty")]
    MissingTitle,

    #[error("block {block}: list has no items")]
    EmptyItems { block: usize },

    #[error("block {block}: table has no columns")]
    NoColumns { block: usize },

    #[error("block {block}: row {row} has {cells} cells, expected {columns}")]
    RowLength {
        block: usize,
        row: usize,
        cells: usize,
        columns: usize,
    },
}

/// Title block fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// One content block, tagged by `type` in JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Block {
    H1 { text: String },
    H2 { text: String },
    H3 { text: String },
    P { text: String },
    Bullets { items: Vec<String> },
    Numbered { items: Vec<String> },
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Pagebreak,
}

/// A titled sequence of blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredDocument {
    pub meta: DocumentMeta,
    pub blocks: Vec<Block>,
}

impl StructuredDocument {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            meta: DocumentMeta {
                title: title.into(),
                author: None,
                date: None,
            },
            blocks: Vec::new(),
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.meta.author = Some(author.into());
        self
    }

    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.meta.date = Some(date.into());
        self
    }

    pub fn push(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self, DocumentError> {
        let document: Self = serde_json::from_str(json)?;
        document.validate()?;
        Ok(document)
    }

    /// Check the rules serde cannot express
    pub fn validate(&self) -> Result<(), DocumentError> {
        if self.meta.title.trim().is_empty() {
            return Err(DocumentError::MissingTitle);
        }

        for (block, b) in self.blocks.iter().enumerate() {
            match b {
                Block::Bullets { items } | Block::Numbered { items } if items.is_empty() => {
                    return Err(DocumentError::EmptyItems { block });
                }
                Block::Table { columns, rows, .. } => {
                    if columns.is_empty() {
                        return Err(DocumentError::NoColumns { block });
                    }
                    if let Some((row, cells)) = rows
                        .iter()
                        .enumerate()
                        .find(|(_, r)| r.len() != columns.len())
                    {
                        return Err(DocumentError::RowLength {
                            block,
                            row,
                            cells: cells.len(),
                            columns: columns.len(),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}
