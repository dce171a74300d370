//! Load newline-delimited JSON documents into a database
//!
//! Every line is one JSON object with an `_id`. A `_rev` makes the line an
//! update of that revision and `_deleted: true` saves a tombstone. The whole
//! file is applied in a single transaction, so listeners see one batch and a
//! bad line leaves the database untouched.

use anyhow::{anyhow, bail, Context, Result};
use revdb_core::{map_from_json, Database, RevisionId, Value};
use std::io::BufRead;
use std::time::Instant;
use tokio::task;
use tracing::info;

/// Totals of one load
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadStats {
    pub documents: u64,
    pub deleted: u64,
}

/// Load a JSONL stream on the blocking pool.
pub async fn load_documents<R: BufRead + Send + 'static>(db: Database, reader: R) -> Result<LoadStats> {
    task::spawn_blocking(move || load_documents_blocking(&db, reader))
        .await
        .map_err(|e| anyhow!("Load task failed: {:?}", e))?
}

fn load_documents_blocking<R: BufRead>(db: &Database, reader: R) -> Result<LoadStats> {
    let start_time = Instant::now();
    let mut last_report = Instant::now();
    let mut stats = LoadStats::default();

    let mut failure = None;
    let committed = db.run_in_transaction(|| {
        match load_lines(db, reader, &mut stats, &mut last_report, start_time) {
            Ok(()) => true,
            Err(e) => {
                failure = Some(e);
                false
            }
        }
    })?;
    if let Some(e) = failure {
        return Err(e);
    }
    if !committed {
        bail!("Load transaction was rolled back");
    }

    let elapsed = start_time.elapsed();
    println!("Load complete!");
    println!("  Documents: {}", stats.documents);
    println!("  Deleted: {}", stats.deleted);
    println!("  Last sequence: {}", db.last_sequence()?);
    println!("  Elapsed: {:.1}s", elapsed.as_secs_f64());
    Ok(stats)
}

fn load_lines<R: BufRead>(
    db: &Database,
    reader: R,
    stats: &mut LoadStats,
    last_report: &mut Instant,
    start_time: Instant,
) -> Result<()> {
    for (index, line) in reader.lines().enumerate() {
        let line_number = index + 1;
        let line = line.with_context(|| format!("Failed to read line {}", line_number))?;
        if line.trim().is_empty() {
            continue;
        }
        let json: serde_json::Value =
            serde_json::from_str(&line).with_context(|| format!("Invalid JSON on line {}", line_number))?;
        let properties = map_from_json(json).with_context(|| format!("Line {} is not an object", line_number))?;

        let doc_id = match properties.get("_id") {
            Some(Value::String(id)) => id.clone(),
            _ => bail!("Line {} has no string _id", line_number),
        };
        let parent = match properties.get("_rev") {
            Some(Value::String(rev)) => Some(RevisionId::parse(rev)?),
            _ => None,
        };
        let deleted = properties.get("_deleted").and_then(Value::as_bool).unwrap_or(false);

        db.put_properties(&doc_id, parent.as_ref(), properties, deleted)
            .with_context(|| format!("Failed to save '{}' from line {}", doc_id, line_number))?;
        stats.documents += 1;
        if deleted {
            stats.deleted += 1;
        }

        if stats.documents % 1000 == 0 || last_report.elapsed().as_secs() >= 5 {
            let elapsed = start_time.elapsed().as_secs_f64();
            info!("  Progress: {} documents in {:.1}s", stats.documents, elapsed);
            *last_report = Instant::now();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_load_documents_in_one_batch() {
        let db = Database::open_in_memory().unwrap();
        let mut stream = db.change_stream();
        let input = "{\"_id\": \"a\", \"n\": 1}\n\n{\"_id\": \"b\", \"n\": 2}\n";

        let stats = load_documents(db.clone(), Cursor::new(input.to_string())).await.unwrap();
        assert_eq!(stats.documents, 2);
        assert_eq!(db.document_count().unwrap(), 2);
        assert_eq!(stream.next().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bad_line_rolls_back_load() {
        let db = Database::open_in_memory().unwrap();
        let input = "{\"_id\": \"a\"}\nnot json\n";

        let result = load_documents(db.clone(), Cursor::new(input.to_string())).await;
        assert!(result.is_err());
        assert_eq!(db.document_count().unwrap(), 0);
        assert_eq!(db.last_sequence().unwrap(), 0);
    }
}
