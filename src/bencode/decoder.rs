//! Byte-slice bencode decoder with span tracking.
//!
//! Earlier drafts of this decoder worked over a `Read` + `Peekable<Bytes<_>>`
//! stream one byte at a time. That shape cannot report where in the source
//! buffer a value started and ended, which the info-hash computation needs
//! (spec requires hashing the *original* bytes of the `info` dict, not a
//! re-encoding). Operating on a `&[u8]` with an explicit cursor gives us that
//! for free and is also simply faster for the in-memory `.torrent`/KRPC
//! payloads this decoder actually sees.
use super::{BencodeError, BencodeResult, BencodeValue, Dict};
use std::ops::Range;

/// A decoded value paired with the half-open byte range `[start, end)` it
/// occupied in the buffer it was decoded from.
#[derive(Debug, Clone)]
pub enum SpannedValue {
    String {
        value: Vec<u8>,
        span: Range<usize>,
    },
    Integer {
        value: i64,
        span: Range<usize>,
    },
    List {
        items: Vec<SpannedValue>,
        span: Range<usize>,
    },
    Dict {
        entries: Vec<(Vec<u8>, SpannedValue)>,
        span: Range<usize>,
    },
}

impl SpannedValue {
    pub fn span(&self) -> Range<usize> {
        match self {
            SpannedValue::String { span, .. }
            | SpannedValue::Integer { span, .. }
            | SpannedValue::List { span, .. }
            | SpannedValue::Dict { span, .. } => span.clone(),
        }
    }

    /// Slices the original source buffer to the raw bytes this value came
    /// from, e.g. to hash the `info` dict without re-encoding it.
    pub fn raw_bytes<'a>(&self, source: &'a [u8]) -> &'a [u8] {
        &source[self.span()]
    }

    pub fn get(&self, key: &[u8]) -> Option<&SpannedValue> {
        match self {
            SpannedValue::Dict { entries, .. } => {
                entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn into_value(self) -> BencodeValue {
        match self {
            SpannedValue::String { value, .. } => BencodeValue::String(value),
            SpannedValue::Integer { value, .. } => BencodeValue::Integer(value),
            SpannedValue::List { items, .. } => {
                BencodeValue::List(items.into_iter().map(SpannedValue::into_value).collect())
            }
            SpannedValue::Dict { entries, .. } => {
                let mut dict: Dict = Dict::new();
                for (k, v) in entries {
                    dict.insert(k, v.into_value());
                }
                BencodeValue::Dict(dict)
            }
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.data.get(self.pos).copied().ok_or(BencodeError::UnexpectedEof)
    }

    fn advance(&mut self) -> BencodeResult<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, b: u8) -> BencodeResult<()> {
        let got = self.advance()?;
        if got != b {
            return Err(BencodeError::InvalidFormat(format!(
                "expected '{}', got '{}'",
                b as char, got as char
            )));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(BencodeError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Reads digits (an optional leading `-`) up to (not including) `stop`.
    fn take_number_str(&mut self, stop: u8) -> BencodeResult<&'a str> {
        let start = self.pos;
        loop {
            let b = self.peek()?;
            if b == stop {
                break;
            }
            if b == b'-' || b.is_ascii_digit() {
                self.pos += 1;
            } else {
                return Err(BencodeError::BadNumber(format!(
                    "unexpected byte 0x{:02x} in number",
                    b
                )));
            }
        }
        let slice = &self.data[start..self.pos];
        self.advance()?; // consume `stop`
        std::str::from_utf8(slice)
            .map_err(|_| BencodeError::BadNumber("non-UTF8 number".to_string()))
    }
}

fn validate_integer_text(text: &str) -> BencodeResult<i64> {
    if text.is_empty() {
        return Err(BencodeError::BadNumber("empty integer".to_string()));
    }
    if text == "-0" {
        return Err(BencodeError::BadNumber("negative zero".to_string()));
    }
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
        return Err(BencodeError::BadNumber(format!(
            "leading zero or empty digits in '{text}'"
        )));
    }
    text.parse::<i64>()
        .map_err(|_| BencodeError::BadNumber(format!("'{text}' does not fit in i64")))
}

fn decode_string_span(cur: &mut Cursor) -> BencodeResult<(Vec<u8>, Range<usize>)> {
    let start = cur.pos;
    let len_text = cur.take_number_str(b':')?;
    if len_text.is_empty() || (len_text.len() > 1 && len_text.starts_with('0')) {
        return Err(BencodeError::BadNumber(format!(
            "invalid byte-string length '{len_text}'"
        )));
    }
    let len: usize = len_text
        .parse()
        .map_err(|_| BencodeError::BadNumber(format!("invalid byte-string length '{len_text}'")))?;
    let bytes = cur.take(len)?.to_vec();
    Ok((bytes, start..cur.pos))
}

fn decode_integer_span(cur: &mut Cursor) -> BencodeResult<(i64, Range<usize>)> {
    let start = cur.pos;
    cur.expect(b'i')?;
    let text = cur.take_number_str(b'e')?;
    let value = validate_integer_text(text)?;
    Ok((value, start..cur.pos))
}

fn decode_list_span(cur: &mut Cursor) -> BencodeResult<(Vec<SpannedValue>, Range<usize>)> {
    let start = cur.pos;
    cur.expect(b'l')?;
    let mut items = Vec::new();
    loop {
        if cur.peek()? == b'e' {
            cur.pos += 1;
            break;
        }
        items.push(decode_value_span(cur)?);
    }
    Ok((items, start..cur.pos))
}

fn decode_dict_span(cur: &mut Cursor) -> BencodeResult<(Vec<(Vec<u8>, SpannedValue)>, Range<usize>)> {
    let start = cur.pos;
    cur.expect(b'd')?;
    let mut entries: Vec<(Vec<u8>, SpannedValue)> = Vec::new();
    loop {
        if cur.peek()? == b'e' {
            cur.pos += 1;
            break;
        }
        let (key, _key_span) = decode_string_span(cur)?;
        if let Some((last_key, _)) = entries.last() {
            if key <= *last_key {
                return Err(BencodeError::DuplicateOrUnorderedKey);
            }
        }
        let value = decode_value_span(cur)?;
        entries.push((key, value));
    }
    Ok((entries, start..cur.pos))
}

fn decode_value_span(cur: &mut Cursor) -> BencodeResult<SpannedValue> {
    match cur.peek()? {
        b'0'..=b'9' => {
            let (value, span) = decode_string_span(cur)?;
            Ok(SpannedValue::String { value, span })
        }
        b'i' => {
            let (value, span) = decode_integer_span(cur)?;
            Ok(SpannedValue::Integer { value, span })
        }
        b'l' => {
            let (items, span) = decode_list_span(cur)?;
            Ok(SpannedValue::List { items, span })
        }
        b'd' => {
            let (entries, span) = decode_dict_span(cur)?;
            Ok(SpannedValue::Dict { entries, span })
        }
        other => Err(BencodeError::InvalidFormat(format!(
            "unexpected byte 0x{:02x}",
            other
        ))),
    }
}

/// Decodes the single top-level bencode value in `data`, retaining the byte
/// span of every nested value.
pub fn decode_with_spans(data: &[u8]) -> BencodeResult<SpannedValue> {
    let mut cur = Cursor::new(data);
    let value = decode_value_span(&mut cur)?;
    if cur.pos != data.len() {
        return Err(BencodeError::TrailingGarbage);
    }
    Ok(value)
}

/// Decodes the single top-level bencode value in `data`.
pub fn decode(data: &[u8]) -> BencodeResult<BencodeValue> {
    decode_with_spans(data).map(SpannedValue::into_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_string() {
        assert_eq!(decode(b"4:spam").unwrap(), BencodeValue::string(*b"spam"));
    }

    #[test]
    fn decodes_zero_length_string() {
        assert_eq!(decode(b"0:").unwrap(), BencodeValue::string(""));
    }

    #[test]
    fn decodes_integer() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-42e").unwrap(), BencodeValue::Integer(-42));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));
    }

    #[test]
    fn rejects_leading_zero_integer() {
        assert!(decode(b"i042e").is_err());
    }

    #[test]
    fn rejects_negative_zero() {
        assert!(decode(b"i-0e").is_err());
    }

    #[test]
    fn decodes_list() {
        assert_eq!(
            decode(b"l4:spami42ee").unwrap(),
            BencodeValue::List(vec![BencodeValue::string(*b"spam"), BencodeValue::Integer(42)])
        );
    }

    #[test]
    fn decodes_dict() {
        let v = decode(b"d3:bar4:spam3:fooi42ee").unwrap();
        let dict = v.as_dict().unwrap();
        assert_eq!(dict.get(b"bar".as_slice()).unwrap().as_bytes().unwrap(), b"spam");
        assert_eq!(dict.get(b"foo".as_slice()).unwrap().as_integer().unwrap(), 42);
    }

    #[test]
    fn rejects_unordered_dict_keys() {
        assert!(matches!(
            decode(b"d3:foo3:bar3:bar3:bazze"),
            Err(BencodeError::DuplicateOrUnorderedKey)
        ));
    }

    #[test]
    fn rejects_duplicate_dict_keys() {
        assert!(matches!(
            decode(b"d3:foo3:bar3:foo3:baze"),
            Err(BencodeError::DuplicateOrUnorderedKey)
        ));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(matches!(decode(b"i1ee"), Err(BencodeError::TrailingGarbage)));
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(matches!(decode(b"5:hi"), Err(BencodeError::UnexpectedEof)));
    }

    #[test]
    fn spans_locate_info_dict_bytes() {
        use super::super::{encode_to_vec, DictBuilder};

        let info = DictBuilder::new()
            .insert("name", BencodeValue::string(*b"foo"))
            .insert("piece length", BencodeValue::Integer(16384))
            .build();
        let torrent = DictBuilder::new()
            .insert("announce", BencodeValue::string(*b"http://tracker.example/a"))
            .insert("info", info.clone())
            .build();
        let data = encode_to_vec(&torrent).unwrap();

        let spanned = decode_with_spans(&data).unwrap();
        let info_span = spanned.get(b"info").unwrap();
        let raw = info_span.raw_bytes(&data);

        // The sliced bytes decode back to exactly the info dict we built,
        // and that slice is byte-identical to re-encoding it in isolation
        // (confirming we sliced the original bytes, not a reconstruction).
        assert_eq!(decode(raw).unwrap(), info);
        assert_eq!(raw, encode_to_vec(&info).unwrap());
    }
}
