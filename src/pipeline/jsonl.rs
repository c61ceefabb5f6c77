//! JSON-lines helpers for record-shaped pipeline stages.

use std::future::Future;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::fileset::FileRecord;

use super::Result;

/// Serialize one record as a JSON line.
pub async fn write_jsonl_record<W>(out: &mut W, record: &FileRecord) -> Result<()>
where
    W: AsyncWrite + Send + Unpin + ?Sized,
{
    let line = serde_json::to_string(record)?;
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    Ok(())
}

/// Read every record from a JSON-lines stream.
pub async fn read_jsonl_records<R>(input: &mut R) -> Result<Vec<FileRecord>>
where
    R: AsyncBufRead + Send + Unpin + ?Sized,
{
    let mut records = Vec::new();
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

/// Stream records from `input` to `out` through `map`, one at a time.
///
/// `map` may drop a record by returning `None`; hooks that filter or
/// rewrite records compose as maps. Records are processed strictly in
/// input order.
pub async fn map_jsonl_records<R, W, F, Fut>(input: &mut R, out: &mut W, mut map: F) -> Result<()>
where
    R: AsyncBufRead + Send + Unpin + ?Sized,
    W: AsyncWrite + Send + Unpin + ?Sized,
    F: FnMut(FileRecord) -> Fut + Send,
    Fut: Future<Output = Result<Option<FileRecord>>> + Send,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let record: FileRecord = serde_json::from_str(&line)?;
        if let Some(mapped) = map(record).await? {
            write_jsonl_record(out, &mapped).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<FileRecord> {
        vec![
            FileRecord::published("a.html", "pages", "c1"),
            FileRecord::published("b.json", "data", "c2"),
            FileRecord::deleted("c.html", "pages", "c3"),
        ]
    }

    async fn to_jsonl(records: &[FileRecord]) -> Vec<u8> {
        let mut buf = Vec::new();
        for record in records {
            write_jsonl_record(&mut buf, record).await.unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn round_trips_records() {
        let records = sample();
        let bytes = to_jsonl(&records).await;
        let mut cursor = std::io::Cursor::new(bytes);
        let back = read_jsonl_records(&mut cursor).await.unwrap();
        assert_eq!(back, records);
    }

    #[tokio::test]
    async fn map_preserves_order_and_drops_none() {
        let bytes = to_jsonl(&sample()).await;
        let mut cursor = std::io::Cursor::new(bytes);
        let mut out = Vec::new();

        map_jsonl_records(&mut cursor, &mut out, |record| async move {
            if record.category == "data" {
                Ok(None)
            } else {
                Ok(Some(record))
            }
        })
        .await
        .unwrap();

        let mut cursor = std::io::Cursor::new(out);
        let kept = read_jsonl_records(&mut cursor).await.unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].path.as_deref(), Some("a.html"));
        assert_eq!(kept[1].path.as_deref(), Some("c.html"));
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let mut cursor = std::io::Cursor::new(b"\n\n".to_vec());
        assert!(read_jsonl_records(&mut cursor).await.unwrap().is_empty());
    }
}
