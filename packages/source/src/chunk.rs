//! Bounded-size chunk reader over CSV sources.
//!
//! Opens a local path or `http(s)` URL (optionally gzip-compressed) and
//! yields rows in chunks of a configured maximum size. The underlying
//! stream is consumed incrementally, so memory stays bounded by one chunk
//! regardless of file size.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use flate2::read::GzDecoder;
use hotspot_models::SourceSpec;

use crate::SourceError;

/// One chunk of rows from a source, with the source's (trimmed) headers.
#[derive(Debug, Clone)]
pub struct RowChunk {
    /// Column headers, whitespace-trimmed, shared across chunks.
    pub headers: Arc<Vec<String>>,
    /// The rows of this chunk.
    pub rows: Vec<csv::StringRecord>,
}

impl RowChunk {
    /// Resolves a column name (trimmed comparison) to its index.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<usize> {
        let wanted = name.trim();
        self.headers.iter().position(|h| h == wanted)
    }
}

/// Streams a CSV source as a sequence of bounded [`RowChunk`]s.
pub struct CsvChunkReader {
    reader: csv::Reader<Box<dyn Read + Send>>,
    headers: Arc<Vec<String>>,
    chunk_size: usize,
    done: bool,
}

impl CsvChunkReader {
    /// Opens the source described by `spec` and reads its header row.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the fetch, decompression setup, or
    /// header parse fails.
    pub fn open(spec: &SourceSpec, chunk_size: usize) -> Result<Self, SourceError> {
        let raw = open_stream(&spec.url)?;
        let decoded: Box<dyn Read + Send> = if spec.gzip || spec.url.ends_with(".gz") {
            Box::new(GzDecoder::new(raw))
        } else {
            raw
        };

        // Non-ASCII delimiters are rejected by config validation.
        #[allow(clippy::cast_possible_truncation)]
        let delimiter = spec.delimiter as u8;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(decoded);

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_owned())
            .collect();
        log::debug!("Opened source {} with {} columns", spec.url, headers.len());

        Ok(Self {
            reader,
            headers: Arc::new(headers),
            chunk_size,
            done: false,
        })
    }

    /// The source's trimmed headers.
    #[must_use]
    pub fn headers(&self) -> &Arc<Vec<String>> {
        &self.headers
    }

    /// Reads the next chunk, or `None` once the source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Csv`] if the CSV layer fails mid-stream;
    /// this aborts the run rather than dropping data silently.
    pub fn next_chunk(&mut self) -> Result<Option<RowChunk>, SourceError> {
        if self.done {
            return Ok(None);
        }

        let mut rows = Vec::with_capacity(self.chunk_size.min(4096));
        for record in self.reader.records() {
            rows.push(record?);
            if rows.len() >= self.chunk_size {
                break;
            }
        }

        if rows.len() < self.chunk_size {
            self.done = true;
        }
        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(RowChunk {
            headers: Arc::clone(&self.headers),
            rows,
        }))
    }
}

fn open_stream(url: &str) -> Result<Box<dyn Read + Send>, SourceError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        let response = reqwest::blocking::get(url)?.error_for_status()?;
        Ok(Box::new(response))
    } else {
        Ok(Box::new(File::open(url)?))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::path::PathBuf;

    use super::*;

    fn spec(url: &str) -> SourceSpec {
        SourceSpec {
            url: url.to_owned(),
            timestamp_col: "date".to_owned(),
            lat_col: "lat".to_owned(),
            lon_col: "lon".to_owned(),
            group_col: "category".to_owned(),
            delimiter: ',',
            gzip: false,
        }
    }

    fn write_temp(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("hotspot_chunk_{name}"));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn chunks_respect_the_configured_size() {
        let mut csv = String::from(" date ,lat,lon,category\n");
        for i in 0..7 {
            csv.push_str(&format!("2024-01-0{},41.0,-87.0,THEFT\n", i + 1));
        }
        let path = write_temp("sized.csv", csv.as_bytes());

        let mut reader = CsvChunkReader::open(&spec(path.to_str().unwrap()), 3).unwrap();
        assert_eq!(reader.headers().as_slice(), ["date", "lat", "lon", "category"]);

        let sizes: Vec<usize> = std::iter::from_fn(|| reader.next_chunk().unwrap())
            .map(|c| c.rows.len())
            .collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn exact_multiple_of_chunk_size_terminates() {
        let csv = "date,lat,lon,category\n2024-01-01,41.0,-87.0,A\n2024-01-02,41.0,-87.0,B\n";
        let path = write_temp("exact.csv", csv.as_bytes());

        let mut reader = CsvChunkReader::open(&spec(path.to_str().unwrap()), 2).unwrap();
        assert_eq!(reader.next_chunk().unwrap().unwrap().rows.len(), 2);
        assert!(reader.next_chunk().unwrap().is_none());
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn resolves_columns_by_trimmed_name() {
        let csv = "date, lat ,lon,category\n2024-01-01,41.0,-87.0,A\n";
        let path = write_temp("trim.csv", csv.as_bytes());

        let mut reader = CsvChunkReader::open(&spec(path.to_str().unwrap()), 10).unwrap();
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.column("lat"), Some(1));
        assert_eq!(chunk.column(" category "), Some(3));
        assert_eq!(chunk.column("missing"), None);
    }

    #[test]
    fn reads_gzip_compressed_sources() {
        let csv = "date,lat,lon,category\n2024-01-01,41.0,-87.0,A\n";
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(csv.as_bytes()).unwrap();
        let path = write_temp("gz.csv.gz", &encoder.finish().unwrap());

        let mut reader = CsvChunkReader::open(&spec(path.to_str().unwrap()), 10).unwrap();
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.rows.len(), 1);
        assert_eq!(&chunk.rows[0][3], "A");
    }

    #[test]
    fn honors_a_custom_delimiter() {
        let csv = "date\tlat\tlon\tcategory\n2024-01-01\t41.0\t-87.0\tA\n";
        let path = write_temp("tabs.tsv", csv.as_bytes());

        let mut source = spec(path.to_str().unwrap());
        source.delimiter = '\t';
        let mut reader = CsvChunkReader::open(&source, 10).unwrap();
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert_eq!(&chunk.rows[0][1], "41.0");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(CsvChunkReader::open(&spec("/nonexistent/hotspot.csv"), 10).is_err());
    }
}
