//! Minimal RFC-4180 reader/writer for the D2L grade import file.
//!
//! Quoted fields may contain commas, doubled quotes and line breaks. The
//! source's BOM and line ending are remembered so a rewrite keeps them.

const BOM: char = '\u{feff}';

/// Parsed CSV text plus the formatting details needed to write it back.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvDocument {
    pub records: Vec<Vec<String>>,
    pub has_bom: bool,
    pub line_ending: LineEnding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

pub fn parse_csv(text: &str) -> CsvDocument {
    let has_bom = text.starts_with(BOM);
    let body = text.strip_prefix(BOM).unwrap_or(text);
    let line_ending = if body.contains("\r\n") {
        LineEnding::CrLf
    } else {
        LineEnding::Lf
    };

    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = body.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(ch);
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(ch),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    // Blank trailing lines carry no data.
    while records
        .last()
        .is_some_and(|r| r.iter().all(|f| f.trim().is_empty()))
    {
        records.pop();
    }

    CsvDocument {
        records,
        has_bom,
        line_ending,
    }
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn write_csv(doc: &CsvDocument) -> String {
    let mut out = String::new();
    if doc.has_bom {
        out.push(BOM);
    }
    for record in &doc.records {
        let line = record
            .iter()
            .map(|f| csv_quote(f))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push_str(doc.line_ending.as_str());
    }
    out
}
