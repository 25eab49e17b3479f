//! Append-only queue log with a persisted delivery cursor.
//!
//! Layout of a queue directory:
//! ```text
//! <dir>/queue.log    one JSON envelope per line, appended and fsynced
//! <dir>/queue.head   {"offset": <byte offset of next undelivered line>, "next_seq": N}
//! ```
//! The head file is replaced atomically (write temp, fsync, rename, fsync dir).
//! When the cursor catches up with the end of the log, the log is truncated to
//! zero and the cursor reset, so the file never grows without bound.
//!
//! A crash mid-append can leave a partial final line; it is truncated on open.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Error, Event, KeyPress, PowerEvent, Result};

const LOG_FILE: &str = "queue.log";
const HEAD_FILE: &str = "queue.head";
const HEAD_TMP_FILE: &str = "queue.head.tmp";

/// Persisted envelope for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Sequence id assigned by the log.
    pub seq: u64,
    /// Type tag selecting how `payload` is decoded.
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    fn new(seq: u64, event: &Event) -> Result<Self> {
        let payload = match event {
            Event::Key(key) => serde_json::to_value(key)?,
            Event::Power(power) => serde_json::to_value(power)?,
        };
        Ok(Self {
            seq,
            kind: event.type_tag().to_string(),
            payload,
            enqueued_at: Utc::now(),
        })
    }

    /// Decode the payload according to the type tag.
    pub fn to_event(&self) -> Result<Event> {
        match self.kind.as_str() {
            Event::KEY_TAG => Ok(Event::Key(serde_json::from_value::<KeyPress>(
                self.payload.clone(),
            )?)),
            Event::POWER_TAG => Ok(Event::Power(serde_json::from_value::<PowerEvent>(
                self.payload.clone(),
            )?)),
            other => Err(Error::storage(format!("unknown queue item type: {}", other))),
        }
    }
}

/// Delivery cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Head {
    offset: u64,
    next_seq: u64,
}

/// One undelivered line read from the log.
#[derive(Debug)]
pub(crate) struct LogEntry {
    line: Vec<u8>,
    /// Offset just past this line; committing it marks the line delivered.
    pub(crate) end: u64,
}

impl LogEntry {
    pub(crate) fn decode(&self) -> Result<(u64, Event)> {
        let item: QueueItem = serde_json::from_slice(&self.line)?;
        let event = item.to_event()?;
        Ok((item.seq, event))
    }
}

/// The on-disk log. Not synchronized; the queue wraps it in a mutex.
#[derive(Debug)]
pub(crate) struct LogStore {
    dir: PathBuf,
    writer: File,
    reader: File,
    head: Head,
    /// Offset of the next line to hand out; at or past `head.offset`.
    read: u64,
    next_seq: u64,
    len: u64,
}

impl LogStore {
    /// Open or create the log in `dir`, recovering from a torn final line.
    pub(crate) fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let log_path = dir.join(LOG_FILE);

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let reader = File::open(&log_path)?;

        let mut head = read_head(&dir.join(HEAD_FILE))?;
        let mut len = writer.metadata()?.len();
        if head.offset > len {
            tracing::warn!(
                offset = head.offset,
                len,
                "Queue cursor is past the end of the log, replaying from the start"
            );
            head.offset = 0;
        }
        if head.offset > 0 && !ends_line(&reader, head.offset)? {
            tracing::warn!(
                offset = head.offset,
                "Queue cursor is not on a line boundary, replaying from the start"
            );
            head.offset = 0;
        }

        let scan = scan_tail(&reader, head.offset)?;
        if let Some(torn_at) = scan.torn_at {
            tracing::warn!(offset = torn_at, "Truncating partial line at end of queue log");
            writer.set_len(torn_at)?;
            writer.sync_all()?;
            len = torn_at;
        }

        let next_seq = scan
            .last_seq
            .map(|seq| seq + 1)
            .unwrap_or(0)
            .max(head.next_seq);

        tracing::debug!(
            dir = %dir.display(),
            pending = scan.lines,
            next_seq,
            "Queue log opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            writer,
            reader,
            head,
            read: head.offset,
            next_seq,
            len,
        })
    }

    /// Append and fsync one event, returning its sequence id.
    pub(crate) fn append(&mut self, event: &Event) -> Result<u64> {
        let item = QueueItem::new(self.next_seq, event)?;
        let mut line = serde_json::to_vec(&item)?;
        line.push(b'\n');

        if self.writer.metadata()?.len() > self.len {
            tracing::warn!(len = self.len, "Discarding bytes left by a failed append");
            self.writer.set_len(self.len)?;
        }
        if let Err(e) = self
            .writer
            .write_all(&line)
            .and_then(|()| self.writer.sync_data())
        {
            if let Err(rollback) = self.writer.set_len(self.len) {
                tracing::error!(error = %rollback, "Failed to roll back partial append");
            }
            return Err(e.into());
        }

        self.len += line.len() as u64;
        self.next_seq += 1;
        Ok(item.seq)
    }

    /// Read the next line not yet handed out, without consuming it.
    pub(crate) fn peek(&mut self) -> Result<Option<LogEntry>> {
        if self.read >= self.len {
            return Ok(None);
        }

        let mut reader = BufReader::new(&self.reader);
        reader.seek(SeekFrom::Start(self.read))?;
        let mut line = Vec::new();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 || line.last() != Some(&b'\n') {
            return Ok(None);
        }
        line.pop();

        Ok(Some(LogEntry {
            line,
            end: self.read + read as u64,
        }))
    }

    /// Move the read position past a line that has been handed out.
    pub(crate) fn advance(&mut self, end: u64) {
        self.read = self.read.max(end.min(self.len));
    }

    /// Mark everything before `end` as delivered and persist the cursor.
    pub(crate) fn commit(&mut self, end: u64) -> Result<()> {
        let offset = end.min(self.len);
        self.advance(offset);
        if offset == self.len && self.len > 0 {
            return self.compact();
        }

        self.head = Head {
            offset,
            next_seq: self.next_seq,
        };
        write_head(&self.dir, &self.head)
    }

    /// Truncate a fully delivered log. The reset cursor reaches disk before
    /// the truncation, so a crash in between replays the old lines instead of
    /// skipping ones appended later.
    fn compact(&mut self) -> Result<()> {
        let reset = Head {
            offset: 0,
            next_seq: self.next_seq,
        };
        write_head(&self.dir, &reset)?;

        if let Err(e) = self.writer.set_len(0).and_then(|()| self.writer.sync_all()) {
            self.head = Head {
                offset: self.len,
                next_seq: self.next_seq,
            };
            write_head(&self.dir, &self.head)?;
            return Err(e.into());
        }

        self.head = reset;
        self.len = 0;
        self.read = 0;
        Ok(())
    }

    /// Number of bytes not yet delivered.
    pub(crate) fn backlog_bytes(&self) -> u64 {
        self.len - self.head.offset
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

struct TailScan {
    lines: usize,
    last_seq: Option<u64>,
    torn_at: Option<u64>,
}

/// Walk the undelivered part of the log to find the last sequence id and a
/// partial trailing line, if any.
fn scan_tail(file: &File, offset: u64) -> io::Result<TailScan> {
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(offset))?;

    let mut scan = TailScan {
        lines: 0,
        last_seq: None,
        torn_at: None,
    };
    let mut pos = offset;
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            scan.torn_at = Some(pos);
            break;
        }
        if let Ok(item) = serde_json::from_slice::<QueueItem>(&line[..line.len() - 1]) {
            scan.last_seq = Some(item.seq);
        }
        scan.lines += 1;
        pos += read as u64;
    }
    Ok(scan)
}

/// Whether the byte before `offset` ends a line.
fn ends_line(file: &File, offset: u64) -> io::Result<bool> {
    let mut file = file;
    file.seek(SeekFrom::Start(offset - 1))?;
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte)?;
    Ok(byte[0] == b'\n')
}

fn read_head(path: &Path) -> Result<Head> {
    let mut raw = String::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_string(&mut raw)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Head::default()),
        Err(e) => return Err(e.into()),
    }
    match serde_json::from_str(&raw) {
        Ok(head) => Ok(head),
        Err(e) => {
            tracing::warn!(error = %e, "Unreadable queue cursor, replaying from the start");
            Ok(Head::default())
        }
    }
}

fn write_head(dir: &Path, head: &Head) -> Result<()> {
    let tmp = dir.join(HEAD_TMP_FILE);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&serde_json::to_vec(head)?)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, dir.join(HEAD_FILE))?;
    fsync_dir(dir)?;
    Ok(())
}

/// Sync directory entries so a rename survives power loss.
fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PowerKind;
    use tempfile::tempdir;

    fn key(code: u8) -> Event {
        Event::Key(KeyPress::pressed(code))
    }

    fn drain_all(store: &mut LogStore) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(entry) = store.peek().unwrap() {
            events.push(entry.decode().unwrap().1);
            store.commit(entry.end).unwrap();
        }
        events
    }

    #[test]
    fn test_append_assigns_increasing_sequence() {
        let dir = tempdir().unwrap();
        let mut store = LogStore::open(dir.path()).unwrap();
        assert_eq!(store.append(&key(1)).unwrap(), 0);
        assert_eq!(store.append(&key(2)).unwrap(), 1);
        assert_eq!(store.append(&key(3)).unwrap(), 2);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let dir = tempdir().unwrap();
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&key(7)).unwrap();

        let first = store.peek().unwrap().unwrap();
        let again = store.peek().unwrap().unwrap();
        assert_eq!(first.end, again.end);
        assert_eq!(first.decode().unwrap().1, key(7));
    }

    #[test]
    fn test_undelivered_items_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path()).unwrap();
            store.append(&key(1)).unwrap();
            store.append(&key(2)).unwrap();
            store.append(&key(3)).unwrap();
            let entry = store.peek().unwrap().unwrap();
            store.commit(entry.end).unwrap();
        }

        let mut store = LogStore::open(dir.path()).unwrap();
        assert_eq!(drain_all(&mut store), vec![key(2), key(3)]);
        assert_eq!(store.next_seq(), 3);
    }

    #[test]
    fn test_full_drain_compacts_log_and_keeps_sequence() {
        let dir = tempdir().unwrap();
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&key(1)).unwrap();
        store.append(&key(2)).unwrap();
        drain_all(&mut store);

        let log_len = std::fs::metadata(dir.path().join(LOG_FILE)).unwrap().len();
        assert_eq!(log_len, 0);
        assert_eq!(store.backlog_bytes(), 0);
        drop(store);

        let mut store = LogStore::open(dir.path()).unwrap();
        assert_eq!(store.append(&key(3)).unwrap(), 2);
    }

    #[test]
    fn test_torn_final_line_is_truncated() {
        let dir = tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path()).unwrap();
            store.append(&key(1)).unwrap();
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_FILE))
            .unwrap();
        file.write_all(br#"{"seq":1,"type":"key","payl"#).unwrap();
        drop(file);

        let mut store = LogStore::open(dir.path()).unwrap();
        assert_eq!(drain_all(&mut store), vec![key(1)]);
        assert_eq!(store.append(&key(2)).unwrap(), 1);
    }

    #[test]
    fn test_corrupt_line_decodes_to_error_but_can_be_skipped() {
        let dir = tempdir().unwrap();
        let mut store = LogStore::open(dir.path()).unwrap();
        store.writer.write_all(b"not json\n").unwrap();
        store.len += 9;
        store
            .append(&Event::Power(PowerEvent::new(PowerKind::Sleep, true)))
            .unwrap();

        let bad = store.peek().unwrap().unwrap();
        assert!(bad.decode().is_err());
        store.commit(bad.end).unwrap();

        let good = store.peek().unwrap().unwrap();
        assert_eq!(
            good.decode().unwrap().1,
            Event::Power(PowerEvent::new(PowerKind::Sleep, true))
        );
    }

    #[test]
    fn test_bytes_left_by_failed_append_do_not_hide_next_event() {
        let dir = tempdir().unwrap();
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&key(1)).unwrap();
        store.writer.write_all(br#"{"seq":1,"type":"key","pay"#).unwrap();

        assert_eq!(store.append(&key(2)).unwrap(), 1);
        assert_eq!(drain_all(&mut store), vec![key(1), key(2)]);
    }

    #[test]
    fn test_compaction_persists_reset_cursor() {
        let dir = tempdir().unwrap();
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&key(1)).unwrap();
        store.append(&key(2)).unwrap();
        drain_all(&mut store);

        assert_eq!(
            read_head(&dir.path().join(HEAD_FILE)).unwrap(),
            Head {
                offset: 0,
                next_seq: 2
            }
        );
    }

    #[test]
    fn test_cursor_inside_a_line_replays_from_start() {
        let dir = tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path()).unwrap();
            store.append(&key(1)).unwrap();
            store.append(&key(2)).unwrap();
        }
        std::fs::write(
            dir.path().join(HEAD_FILE),
            br#"{"offset":5,"next_seq":2}"#,
        )
        .unwrap();

        let mut store = LogStore::open(dir.path()).unwrap();
        assert_eq!(drain_all(&mut store), vec![key(1), key(2)]);
    }

    #[test]
    fn test_read_position_runs_ahead_of_cursor() {
        let dir = tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path()).unwrap();
            store.append(&key(1)).unwrap();
            store.append(&key(2)).unwrap();
            let first = store.peek().unwrap().unwrap();
            store.advance(first.end);
            let second = store.peek().unwrap().unwrap();
            assert_eq!(second.decode().unwrap().1, key(2));
            store.advance(second.end);
            assert!(store.peek().unwrap().is_none());
        }

        let mut store = LogStore::open(dir.path()).unwrap();
        assert_eq!(drain_all(&mut store), vec![key(1), key(2)]);
    }

    #[test]
    fn test_unknown_type_tag_is_rejected() {
        let item = QueueItem {
            seq: 0,
            kind: "volume".to_string(),
            payload: serde_json::json!({"step": 5}),
            enqueued_at: Utc::now(),
        };
        assert!(item.to_event().is_err());
    }

    #[test]
    fn test_unreadable_head_replays_from_start() {
        let dir = tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path()).unwrap();
            store.append(&key(1)).unwrap();
        }
        std::fs::write(dir.path().join(HEAD_FILE), b"garbage").unwrap();

        let mut store = LogStore::open(dir.path()).unwrap();
        assert_eq!(drain_all(&mut store), vec![key(1)]);
    }
}
