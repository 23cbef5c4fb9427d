use crate::error::IngestError;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tokio_util::sync::CancellationToken;

const SAMPLE_LINES: usize = 10;
const SNIFF_BYTES: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Utf16Le,
    Utf16Be,
    Windows1252,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delimiter {
    Single(char),
    Multi(&'static str),
}

impl Delimiter {
    fn split(&self, line: &str) -> Vec<String> {
        match self {
            Delimiter::Single(ch) => line.split(*ch).map(|f| f.trim().to_string()).collect(),
            Delimiter::Multi(seq) => line.split(seq).map(|f| f.trim().to_string()).collect(),
        }
    }
}

///
/// The shape of a CSV file as detected from its first 4KiB (encoding) and up to ten sample
/// lines (delimiter), plus the sanitiser-ready raw header fields.
///
#[derive(Clone, Debug)]
pub struct CsvLayout {
    pub encoding: Encoding,
    pub delimiter: Delimiter,
    pub header: Vec<String>,
}

#[derive(Debug)]
pub enum RowEvent {
    Row { line_number: u64, fields: Vec<String> },
    Error { line_number: u64, message: String },
}

///
/// Detect encoding and delimiter, and return the header columns. This is the single pass that
/// must happen before a file can be streamed or sampled for type inference.
///
pub fn analyse_layout(path: &Path) -> Result<CsvLayout, IngestError> {
    let encoding = detect_encoding(path)?;
    log::debug!("detected encoding {:?} for {}", encoding, path.display());

    let mut source = LineSource::open(path, encoding)?;
    let header_line = read_next_non_blank(&mut source)?
        .ok_or_else(|| IngestError::MissingHeader { path: path.to_string_lossy().into() })?;

    let mut samples = Vec::with_capacity(SAMPLE_LINES + 1);
    samples.push(header_line.clone());
    while samples.len() < SAMPLE_LINES + 1 {
        match read_next_non_blank(&mut source)? {
            Some(line) => samples.push(line),
            None => break,
        }
    }

    let delimiter = detect_delimiter(&samples)
        .ok_or_else(|| IngestError::UndetectableDelimiter { path: path.to_string_lossy().into() })?;
    log::debug!("detected delimiter {:?} for {}", delimiter, path.display());

    let header = delimiter.split(&header_line);
    if header.is_empty() || (header.len() == 1 && header[0].is_empty()) {
        return Err(IngestError::EmptyHeaderColumns { path: path.to_string_lossy().into() });
    }
    log::info!("read header ({} columns) from {}", header.len(), path.display());

    Ok(CsvLayout { encoding, delimiter, header })
}

///
/// Stream the data rows of a file (the header line is consumed and discarded). Blank lines are
/// skipped silently; column-count mismatches surface as `RowEvent::Error` and are not yielded as
/// rows. `cancel` is polled before every line.
///
pub fn stream_rows(path: &Path, layout: &CsvLayout, cancel: CancellationToken) -> Result<RowStream, IngestError> {
    let mut source = LineSource::open(path, layout.encoding)?;
    // Discard the header line - it was already consumed logically by analyse_layout.
    source.next_line()?;

    Ok(RowStream {
        source,
        delimiter: layout.delimiter,
        expected_columns: layout.header.len(),
        line_number: 1,
        cancel,
    })
}

pub struct RowStream {
    source: LineSource,
    delimiter: Delimiter,
    expected_columns: usize,
    line_number: u64,
    cancel: CancellationToken,
}

impl Iterator for RowStream {
    type Item = RowEvent;

    fn next(&mut self) -> Option<RowEvent> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            let raw = match self.source.next_line() {
                Ok(Some(raw)) => raw,
                Ok(None) => return None,
                Err(err) => {
                    self.line_number += 1;
                    return Some(RowEvent::Error { line_number: self.line_number, message: err.to_string() });
                }
            };
            self.line_number += 1;

            if raw.trim().is_empty() {
                continue;
            }

            let fields = self.delimiter.split(&raw);
            if fields.len() != self.expected_columns {
                return Some(RowEvent::Error {
                    line_number: self.line_number,
                    message: format!("expected {} columns, found {}", self.expected_columns, fields.len()),
                });
            }

            return Some(RowEvent::Row { line_number: self.line_number, fields });
        }
    }
}

fn read_next_non_blank(source: &mut LineSource) -> Result<Option<String>, IngestError> {
    loop {
        match source.next_line()? {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => return Ok(Some(line)),
            None => return Ok(None),
        }
    }
}

///
/// BOM check first, then a UTF-8 round-trip probe, falling back to Windows-1252 (§4.2).
///
fn detect_encoding(path: &Path) -> Result<Encoding, IngestError> {
    let mut file = File::open(path).map_err(|source| IngestError::CannotOpenFile { path: path.to_string_lossy().into(), source })?;
    let mut buf = vec![0u8; SNIFF_BYTES];
    let n = file.read(&mut buf).map_err(|source| IngestError::CannotOpenFile { path: path.to_string_lossy().into(), source })?;
    buf.truncate(n);

    if buf.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return Ok(Encoding::Utf8);
    }
    if buf.starts_with(&[0xFF, 0xFE]) {
        return Ok(Encoding::Utf16Le);
    }
    if buf.starts_with(&[0xFE, 0xFF]) {
        return Ok(Encoding::Utf16Be);
    }

    if let Ok(s) = std::str::from_utf8(&buf) {
        if s.as_bytes() == buf {
            return Ok(Encoding::Utf8);
        }
    }

    Ok(Encoding::Windows1252)
}

///
/// Try the multi-char candidates first, then score the single-char candidates by how consistent
/// the resulting column counts are across the sample lines (§4.2).
///
fn detect_delimiter(samples: &[String]) -> Option<Delimiter> {
    // samples[0] is always the header line - it must exhibit the delimiter even if later data
    // rows are malformed (those surface as column-mismatch errors once streaming starts).
    for candidate in ["||", ";;"] {
        let counts: Vec<usize> = samples.iter().map(|line| line.split(candidate).count()).collect();
        let first = counts[0];
        if first > 1 && counts.iter().all(|c| *c == first) {
            return Some(Delimiter::Multi(candidate));
        }
    }

    const PRIORITY: [char; 6] = [';', ',', '\t', '|', ':', ' '];
    let mut best: Option<(char, f64)> = None;

    for ch in PRIORITY {
        let counts: Vec<usize> = samples.iter().map(|line| line.split(ch).count()).collect();
        if counts[0] < 2 {
            continue;
        }

        let score = 1.0 / (1.0 + variance(&counts));
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((ch, score)),
        }
    }

    best.map(|(ch, _)| Delimiter::Single(ch))
}

fn variance(counts: &[usize]) -> f64 {
    let n = counts.len() as f64;
    let mean = counts.iter().sum::<usize>() as f64 / n;
    counts.iter().map(|c| { let d = *c as f64 - mean; d * d }).sum::<f64>() / n
}

///
/// Incrementally decodes a byte stream into lines without materialising the whole file - bounded
/// by a fixed read buffer regardless of file size.
///
struct LineSource {
    reader: BufReader<File>,
    decoder: encoding_rs::Decoder,
    leftover: String,
    eof: bool,
}

impl LineSource {
    fn open(path: &Path, encoding: Encoding) -> Result<Self, IngestError> {
        let file = File::open(path).map_err(|source| IngestError::CannotOpenFile { path: path.to_string_lossy().into(), source })?;
        let encoding_rs = match encoding {
            Encoding::Utf8 => encoding_rs::UTF_8,
            Encoding::Utf16Le => encoding_rs::UTF_16LE,
            Encoding::Utf16Be => encoding_rs::UTF_16BE,
            Encoding::Windows1252 => encoding_rs::WINDOWS_1252,
        };

        Ok(Self {
            reader: BufReader::with_capacity(64 * 1024, file),
            decoder: encoding_rs.new_decoder(),
            leftover: String::new(),
            eof: false,
        })
    }

    fn next_line(&mut self) -> Result<Option<String>, IngestError> {
        loop {
            if let Some(pos) = self.leftover.find('\n') {
                let mut line: String = self.leftover.drain(..=pos).collect();
                line.pop(); // the '\n'
                if line.ends_with('\r') {
                    line.pop();
                }
                return Ok(Some(line));
            }

            if self.eof {
                return if self.leftover.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(&mut self.leftover)))
                };
            }

            let mut buf = [0u8; 64 * 1024];
            let n = self.reader.read(&mut buf)?;
            let is_final = n == 0;
            if is_final {
                self.eof = true;
            }

            let mut decoded = String::with_capacity(n * 2 + 16);
            let mut total_read = 0;
            loop {
                let (result, read, _) = self.decoder.decode_to_string(&buf[total_read..n], &mut decoded, is_final);
                total_read += read;
                if result == encoding_rs::CoderResult::InputEmpty || total_read >= n {
                    break;
                }
                decoded.reserve(decoded.capacity() + 64);
            }
            self.leftover.push_str(&decoded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_semicolon_detection() {
        let f = write_temp("id;amount;date\n1;10.50;2024-01-02\n2;x;2024/02/03\n");
        let layout = analyse_layout(f.path()).unwrap();
        assert_eq!(Delimiter::Single(';'), layout.delimiter);
        assert_eq!(vec!["id", "amount", "date"], layout.header);
    }

    #[test]
    fn test_comma_detection() {
        let f = write_temp("name,age\nAlice,30\nBob,\n");
        let layout = analyse_layout(f.path()).unwrap();
        assert_eq!(Delimiter::Single(','), layout.delimiter);
    }

    #[test]
    fn test_all_single_char_candidates_detected_consistently() {
        for (sep, text) in [
            (',', "a,b,c\n1,2,3\n4,5,6\n"),
            (';', "a;b;c\n1;2;3\n4;5;6\n"),
            ('\t', "a\tb\tc\n1\t2\t3\n4\t5\t6\n"),
            ('|', "a|b|c\n1|2|3\n4|5|6\n"),
            (':', "a:b:c\n1:2:3\n4:5:6\n"),
            (' ', "a b c\n1 2 3\n4 5 6\n"),
        ] {
            let f = write_temp(text);
            let layout = analyse_layout(f.path()).unwrap();
            assert_eq!(Delimiter::Single(sep), layout.delimiter, "failed for {:?}", sep);
        }
    }

    #[test]
    fn test_utf8_bom_header_matches_plain() {
        let f1 = write_temp("a,b\n1,2\n");
        let f2_contents = "\u{FEFF}a,b\n1,2\n".to_string();
        let f2 = write_temp(&f2_contents);

        let l1 = analyse_layout(f1.path()).unwrap();
        let l2 = analyse_layout(f2.path()).unwrap();
        assert_eq!(l1.header, l2.header);
    }

    #[test]
    fn test_undetectable_delimiter_is_structural() {
        let f = write_temp("justoneword\nanotherword\nthirdword\n");
        let result = analyse_layout(f.path());
        assert!(matches!(result, Err(IngestError::UndetectableDelimiter { .. })));
    }

    #[test]
    fn test_missing_header_on_empty_file() {
        let f = write_temp("");
        let result = analyse_layout(f.path());
        assert!(matches!(result, Err(IngestError::MissingHeader { .. })));
    }

    #[test]
    fn test_zero_row_file_still_detects_delimiter_from_header() {
        let f = write_temp("a,b,c\n");
        let layout = analyse_layout(f.path()).unwrap();
        assert_eq!(vec!["a", "b", "c"], layout.header);

        let rows: Vec<_> = stream_rows(f.path(), &layout, CancellationToken::new()).unwrap().collect();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_column_mismatch_reported_not_yielded() {
        let f = write_temp("a;b\nonly-one-field\n");
        let layout = analyse_layout(f.path()).unwrap();
        let rows: Vec<_> = stream_rows(f.path(), &layout, CancellationToken::new()).unwrap().collect();

        assert_eq!(1, rows.len());
        match &rows[0] {
            RowEvent::Error { line_number, .. } => assert_eq!(2, *line_number),
            RowEvent::Row { .. } => panic!("expected an error event"),
        }
    }

    #[test]
    fn test_blank_lines_are_skipped_silently() {
        let f = write_temp("a,b\n1,2\n\n3,4\n");
        let layout = analyse_layout(f.path()).unwrap();
        let rows: Vec<_> = stream_rows(f.path(), &layout, CancellationToken::new()).unwrap().collect();
        assert_eq!(2, rows.len());
    }

    #[test]
    fn test_cancellation_stops_streaming() {
        let f = write_temp("a,b\n1,2\n3,4\n5,6\n");
        let layout = analyse_layout(f.path()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let rows: Vec<_> = stream_rows(f.path(), &layout, cancel).unwrap().collect();
        assert!(rows.is_empty());
    }
}
