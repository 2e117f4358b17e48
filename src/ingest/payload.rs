//! CSV wire format for the ingestion endpoint.
//!
//! Newline-delimited rows, comma separated, text fields quoted (embedded
//! quotes doubled), numeric fields bare. Every payload starts with a fixed
//! header row.

use crate::ingest::types::NormalizedRecord;

pub const COLUMNS: [&str; 5] = ["id", "date", "text", "tag", "polarity"];

/// Header row, terminated.
pub fn header_row() -> String {
    let mut out = String::new();
    for (i, c) in COLUMNS.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_quoted(&mut out, c);
    }
    out.push('\n');
    out
}

/// One terminated data row.
pub fn encode_row(rec: &NormalizedRecord) -> String {
    let mut out = String::with_capacity(rec.text.len() + rec.tag.len() + 64);
    out.push_str(&rec.id.to_string());
    out.push(',');
    push_quoted(&mut out, &rec.timestamp);
    out.push(',');
    push_quoted(&mut out, &rec.text);
    out.push(',');
    push_quoted(&mut out, &rec.tag);
    out.push(',');
    out.push_str(&format_polarity(rec.polarity));
    out.push('\n');
    out
}

/// Serialized size of a record's row in bytes (what the byte trigger counts).
pub fn row_size(rec: &NormalizedRecord) -> usize {
    encode_row(rec).len()
}

/// Header followed by every row, in order.
pub fn encode_batch<'a, I>(records: I) -> String
where
    I: IntoIterator<Item = &'a NormalizedRecord>,
{
    let mut out = header_row();
    for rec in records {
        out.push_str(&encode_row(rec));
    }
    out
}

fn push_quoted(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
}

fn format_polarity(p: f64) -> String {
    if p == 0.0 || !p.is_finite() {
        return "0.0".to_string();
    }
    let s = p.to_string();
    if s.contains('.') {
        s
    } else {
        format!("{s}.0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(text: &str, polarity: f64) -> NormalizedRecord {
        NormalizedRecord {
            id: 1050118621198921728,
            timestamp: "2018-10-10 20:19:24".into(),
            text: text.into(),
            tag: "covid".into(),
            polarity,
        }
    }

    #[test]
    fn header_is_fixed() {
        assert_eq!(header_row(), "\"id\",\"date\",\"text\",\"tag\",\"polarity\"\n");
    }

    #[test]
    fn row_quotes_text_not_numbers() {
        assert_eq!(
            encode_row(&rec("hello world", 0.25)),
            "1050118621198921728,\"2018-10-10 20:19:24\",\"hello world\",\"covid\",0.25\n"
        );
    }

    #[test]
    fn embedded_quotes_are_doubled() {
        let row = encode_row(&rec("say \"hi\"", -1.0));
        assert!(row.contains("\"say \"\"hi\"\"\""));
        assert!(row.ends_with(",-1.0\n"));
    }

    #[test]
    fn neutral_polarity_renders_as_float() {
        assert!(encode_row(&rec("x", -0.0)).ends_with(",0.0\n"));
    }

    #[test]
    fn batch_is_header_plus_rows() {
        let a = rec("a", 0.1);
        let b = rec("b", 0.2);
        let out = encode_batch([&a, &b]);
        assert_eq!(out.lines().count(), 3);
        assert_eq!(out.len(), header_row().len() + row_size(&a) + row_size(&b));
    }
}
