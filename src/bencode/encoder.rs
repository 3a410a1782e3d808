//! Bencode encoder. Dict keys are emitted in bytewise ascending order, which
//! falls out for free since [`super::Dict`] is a `BTreeMap`.
use super::{BencodeResult, BencodeValue, Dict};
use std::io::Write;
use tracing::instrument;

#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(writer: &mut W, dict: &Dict) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

#[instrument(skip(writer), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

pub fn encode_to_vec(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode(&mut buf, value)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::super::decode;
    use super::*;

    #[test]
    fn round_trips_every_kind() {
        let value = BencodeValue::List(vec![
            BencodeValue::string(*b"spam"),
            BencodeValue::Integer(-7),
            BencodeValue::Dict({
                let mut d = Dict::new();
                d.insert(b"z".to_vec(), BencodeValue::Integer(1));
                d.insert(b"a".to_vec(), BencodeValue::Integer(2));
                d
            }),
        ]);
        let encoded = encode_to_vec(&value).unwrap();
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn dict_keys_emitted_sorted() {
        let mut d = Dict::new();
        d.insert(b"zebra".to_vec(), BencodeValue::Integer(1));
        d.insert(b"apple".to_vec(), BencodeValue::Integer(2));
        let encoded = encode_to_vec(&BencodeValue::Dict(d)).unwrap();
        assert_eq!(encoded, b"d5:applei2e5:zebrai1ee");
    }
}
