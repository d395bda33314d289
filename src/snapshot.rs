//! Persisted state round-trip (§6 "Persisted state layout", §9.8):
//! newline-delimited JSON records written atomically, one per silence or
//! nflog entry.

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use tokio::{
	fs,
	io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
};
use tracing::warn;

use crate::error::Error;

/// Loads records from a newline-delimited JSON file. Each line is parsed
/// independently; a corrupt line is skipped with a warning rather than
/// failing the whole file. A file that can't be opened/read at all is
/// `Fatal`.
pub async fn load<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, Error> {
	if !fs::try_exists(path).await.unwrap_or(false) {
		return Ok(Vec::new());
	}

	let file = fs::File::open(path)
		.await
		.map_err(|err| Error::fatal(format!("cannot open snapshot {}: {err}", path.display())))?;
	let mut lines = BufReader::new(file).lines();

	let mut records = Vec::new();
	let mut line_no = 0usize;
	loop {
		line_no += 1;
		let line = lines
			.next_line()
			.await
			.map_err(|err| Error::fatal(format!("cannot read snapshot {}: {err}", path.display())))?;
		let Some(line) = line else { break };
		if line.trim().is_empty() {
			continue;
		}
		match serde_json::from_str(&line) {
			Ok(record) => records.push(record),
			Err(err) => warn!(path = %path.display(), line_no, "skipping corrupt snapshot record: {err}"),
		}
	}
	Ok(records)
}

/// Writes `records` atomically: serialize to a temp file in the same
/// directory, flush, then rename over the target — matching the teacher's
/// careful use of atomic file replacement elsewhere in the pack.
pub async fn save<T: Serialize>(path: &Path, records: &[T]) -> Result<(), Error> {
	let dir = path.parent().unwrap_or_else(|| Path::new("."));
	let tmp_path = dir.join(format!(
		".{}.tmp-{}",
		path.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot"),
		std::process::id()
	));

	let mut file = fs::File::create(&tmp_path)
		.await
		.map_err(|err| Error::fatal(format!("cannot create snapshot temp file: {err}")))?;

	for record in records {
		let mut line = serde_json::to_string(record)
			.map_err(|err| Error::fatal(format!("cannot serialize snapshot record: {err}")))?;
		line.push('\n');
		file.write_all(line.as_bytes())
			.await
			.map_err(|err| Error::fatal(format!("cannot write snapshot temp file: {err}")))?;
	}
	file.flush()
		.await
		.map_err(|err| Error::fatal(format!("cannot flush snapshot temp file: {err}")))?;
	drop(file);

	fs::rename(&tmp_path, path)
		.await
		.map_err(|err| Error::fatal(format!("cannot rename snapshot into place: {err}")))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde::{Deserialize, Serialize};

	#[derive(Debug, PartialEq, Serialize, Deserialize)]
	struct Record {
		id: u32,
		name: String,
	}

	#[tokio::test]
	async fn round_trips_records() {
		let dir = std::env::temp_dir().join(format!("klaxon-snapshot-test-{}", std::process::id()));
		fs::create_dir_all(&dir).await.unwrap();
		let path = dir.join("records.ndjson");

		let records = vec![
			Record { id: 1, name: "a".into() },
			Record { id: 2, name: "b".into() },
		];
		save(&path, &records).await.unwrap();

		let loaded: Vec<Record> = load(&path).await.unwrap();
		assert_eq!(loaded, records);

		fs::remove_dir_all(&dir).await.ok();
	}

	#[tokio::test]
	async fn missing_file_loads_as_empty() {
		let path = std::env::temp_dir().join("klaxon-snapshot-test-missing.ndjson");
		let loaded: Vec<Record> = load(&path).await.unwrap();
		assert!(loaded.is_empty());
	}

	#[tokio::test]
	async fn corrupt_line_is_skipped_not_fatal() {
		let dir = std::env::temp_dir().join(format!("klaxon-snapshot-corrupt-{}", std::process::id()));
		fs::create_dir_all(&dir).await.unwrap();
		let path = dir.join("records.ndjson");

		fs::write(&path, "{\"id\":1,\"name\":\"a\"}\nnot json\n{\"id\":2,\"name\":\"b\"}\n")
			.await
			.unwrap();

		let loaded: Vec<Record> = load(&path).await.unwrap();
		assert_eq!(loaded.len(), 2);

		fs::remove_dir_all(&dir).await.ok();
	}
}
