//! Code-symbol index storage
//!
//! Batch indexing replaces a file's symbols atomically: delete old rows,
//! insert new ones, upsert the file metadata - all in one transaction so a
//! crashed indexer never leaves a file half-indexed.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tracing::debug;
use uuid::Uuid;

use crate::types::CodeSymbol;
use crate::{MemoryStore, Result, StoreError};

const SYMBOL_COLS: &str = "id, name, full_name, kind, file_path, line_start, line_end, column_start, \
                           signature, documentation, parent_id, visibility, is_static, return_type, \
                           last_indexed";

/// A symbol as produced by the extractor, before ids are assigned
#[derive(Debug, Clone, Default)]
pub struct NewSymbol {
    pub name: String,
    pub full_name: String,
    pub kind: String,
    pub line_start: i64,
    pub line_end: i64,
    pub column_start: i64,
    pub signature: Option<String>,
    pub documentation: Option<String>,

    /// Index of the enclosing symbol within the same batch
    pub parent_index: Option<usize>,

    pub visibility: Option<String>,
    pub is_static: bool,
    pub return_type: Option<String>,
}

/// A reference as produced by the extractor
#[derive(Debug, Clone)]
pub struct NewSymbolRef {
    /// Index of the referenced symbol within the same batch
    pub symbol_index: usize,

    pub file_path: String,
    pub line: i64,
    pub column: i64,
    pub snippet: Option<String>,

    /// call / read / write / type / inherit
    pub kind: String,
}

/// A stored reference to a symbol
#[derive(Debug, Clone)]
pub struct SymbolRef {
    pub symbol_id: String,
    pub file_path: String,
    pub line: i64,
    pub column: i64,
    pub snippet: Option<String>,
    pub kind: String,
}

/// Recorded metadata for an indexed file
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub path: String,
    pub hash: String,
    pub size: i64,
    pub last_indexed: DateTime<Utc>,
    pub symbol_count: i64,
}

fn symbol_from_row(row: &Row) -> rusqlite::Result<CodeSymbol> {
    Ok(CodeSymbol {
        id: row.get(0)?,
        name: row.get(1)?,
        full_name: row.get(2)?,
        kind: row.get(3)?,
        file_path: row.get(4)?,
        line_start: row.get(5)?,
        line_end: row.get(6)?,
        column_start: row.get(7)?,
        signature: row.get(8)?,
        documentation: row.get(9)?,
        parent_id: row.get(10)?,
        visibility: row.get(11)?,
        is_static: row.get(12)?,
        return_type: row.get(13)?,
        last_indexed: row.get(14)?,
    })
}

impl MemoryStore {
    /// Replace a file's symbols and references atomically
    ///
    /// Returns the number of symbols stored.
    pub fn index_file(
        &self,
        path: &str,
        hash: &str,
        size: i64,
        symbols: Vec<NewSymbol>,
        refs: Vec<NewSymbolRef>,
    ) -> Result<usize> {
        for r in &refs {
            if r.symbol_index >= symbols.len() {
                return Err(StoreError::Invalid(format!(
                    "reference points at symbol index {} but batch has {} symbols",
                    r.symbol_index,
                    symbols.len()
                )));
            }
        }

        let now = Utc::now();
        let ids: Vec<String> = symbols.iter().map(|_| Uuid::now_v7().to_string()).collect();

        let mut conn = self.db().conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM symbols WHERE file_path = ?1", params![path])?;

        for (i, sym) in symbols.iter().enumerate() {
            let parent_id = match sym.parent_index {
                Some(p) if p < i => Some(ids[p].clone()),
                Some(p) => {
                    return Err(StoreError::Invalid(format!(
                        "symbol {i} references parent index {p} which is not an earlier symbol"
                    )));
                }
                None => None,
            };

            tx.execute(
                &format!(
                    "INSERT INTO symbols ({SYMBOL_COLS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    ids[i],
                    sym.name,
                    sym.full_name,
                    sym.kind,
                    path,
                    sym.line_start,
                    sym.line_end,
                    sym.column_start,
                    sym.signature,
                    sym.documentation,
                    parent_id,
                    sym.visibility,
                    sym.is_static,
                    sym.return_type,
                    now,
                ],
            )?;
        }

        for r in &refs {
            tx.execute(
                "INSERT INTO symbol_refs (symbol_id, file_path, line, column, snippet, kind) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![ids[r.symbol_index], r.file_path, r.line, r.column, r.snippet, r.kind],
            )?;
        }

        tx.execute(
            "INSERT INTO files (path, hash, size, last_indexed, symbol_count) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(path) DO UPDATE SET \
               hash = excluded.hash, size = excluded.size, \
               last_indexed = excluded.last_indexed, symbol_count = excluded.symbol_count",
            params![path, hash, size, now, symbols.len() as i64],
        )?;

        tx.commit()?;

        debug!(path, symbols = symbols.len(), refs = refs.len(), "File indexed");
        Ok(symbols.len())
    }

    /// Recorded metadata for a file, if it was ever indexed
    pub fn file_metadata(&self, path: &str) -> Result<Option<FileMetadata>> {
        let conn = self.db().conn()?;
        let meta = conn
            .query_row(
                "SELECT path, hash, size, last_indexed, symbol_count FROM files WHERE path = ?1",
                params![path],
                |row| {
                    Ok(FileMetadata {
                        path: row.get(0)?,
                        hash: row.get(1)?,
                        size: row.get(2)?,
                        last_indexed: row.get(3)?,
                        symbol_count: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }

    /// Find symbols whose name contains `fragment`
    pub fn symbols_by_name(&self, fragment: &str, limit: usize) -> Result<Vec<CodeSymbol>> {
        let pattern = format!("%{}%", fragment.replace('%', "\\%").replace('_', "\\_"));
        let conn = self.db().conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SYMBOL_COLS} FROM symbols WHERE name LIKE ?1 ESCAPE '\\' \
             ORDER BY name, file_path LIMIT ?2"
        ))?;
        let symbols = stmt
            .query_map(params![pattern, limit as i64], symbol_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(symbols)
    }

    /// All symbols defined in a file, in source order
    pub fn symbols_in_file(&self, path: &str) -> Result<Vec<CodeSymbol>> {
        let conn = self.db().conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SYMBOL_COLS} FROM symbols WHERE file_path = ?1 ORDER BY line_start, column_start"
        ))?;
        let symbols = stmt
            .query_map(params![path], symbol_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(symbols)
    }

    /// Look up a single symbol
    pub fn symbol_by_id(&self, id: &str) -> Result<Option<CodeSymbol>> {
        let conn = self.db().conn()?;
        let symbol = conn
            .query_row(
                &format!("SELECT {SYMBOL_COLS} FROM symbols WHERE id = ?1"),
                params![id],
                symbol_from_row,
            )
            .optional()?;
        Ok(symbol)
    }

    /// References to a symbol, in file/line order
    pub fn references_to(&self, symbol_id: &str) -> Result<Vec<SymbolRef>> {
        let conn = self.db().conn()?;
        let mut stmt = conn.prepare(
            "SELECT symbol_id, file_path, line, column, snippet, kind \
             FROM symbol_refs WHERE symbol_id = ?1 ORDER BY file_path, line",
        )?;
        let refs = stmt
            .query_map(params![symbol_id], |row| {
                Ok(SymbolRef {
                    symbol_id: row.get(0)?,
                    file_path: row.get(1)?,
                    line: row.get(2)?,
                    column: row.get(3)?,
                    snippet: row.get(4)?,
                    kind: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(refs)
    }

    /// Drop a file and its symbols from the index
    pub fn remove_indexed_file(&self, path: &str) -> Result<()> {
        let mut conn = self.db().conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM symbols WHERE file_path = ?1", params![path])?;
        tx.execute("DELETE FROM files WHERE path = ?1", params![path])?;
        tx.commit()?;
        Ok(())
    }
}
