//! Streaming field-path queries over encoded documents.
//!
//! A path is a dotted expression (`Address.City`). A `*` segment
//! flattens one level of array, yielding one match per element; a
//! numeric segment selects a single array index. Matching walks the raw
//! msgpack payload directly: values off the path are skipped by marker
//! arithmetic and never materialized.
//!
//! Timestamps use the msgpack `-1` extension in its 4, 8 and 12 byte
//! forms. Other extension payloads surface as [`Value::Bytes`].

use rmp::Marker;

use crate::error::{Error, Result};
use crate::value::Value;

const TIMESTAMP_EXT: i8 = -1;

/// Runs a field-path query, returning every matching value in document
/// order. A path that matches nothing yields an empty vector.
pub(crate) fn query(data: &[u8], path: &str) -> Result<Vec<Value>> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut walker = Walker::new(data);
    let mut out = Vec::new();
    walk(&mut walker, &segments, &mut out)?;
    Ok(out)
}

/// Decodes only the length header of a msgpack array.
///
/// Index entries store their primary-key lists as msgpack arrays of
/// strings; cardinality queries sum these headers without touching the
/// elements.
pub(crate) fn decode_array_count(header: &[u8]) -> u64 {
    let Some(&first) = header.first() else {
        return 0;
    };
    if first >> 4 == 0x9 {
        u64::from(first & 0x0f)
    } else if first == 0xdc && header.len() >= 3 {
        u64::from(u16::from_be_bytes([header[1], header[2]]))
    } else if first == 0xdd && header.len() >= 5 {
        u64::from(u32::from_be_bytes([
            header[1], header[2], header[3], header[4],
        ]))
    } else {
        0
    }
}

fn walk(w: &mut Walker<'_>, segments: &[&str], out: &mut Vec<Value>) -> Result<()> {
    let Some((segment, rest)) = segments.split_first() else {
        let value = read_value(w)?;
        out.push(value);
        return Ok(());
    };

    match w.peek()? {
        Marker::FixMap(_) | Marker::Map16 | Marker::Map32 => {
            let len = read_map_len(w)?;
            for _ in 0..len {
                let key = read_str(w)?;
                if key == *segment {
                    walk(w, rest, out)?;
                } else {
                    skip_value(w)?;
                }
            }
            Ok(())
        }
        Marker::FixArray(_) | Marker::Array16 | Marker::Array32 => {
            let len = read_array_len(w)?;
            if *segment == "*" {
                for _ in 0..len {
                    walk(w, rest, out)?;
                }
            } else if let Ok(want) = segment.parse::<u32>() {
                for i in 0..len {
                    if i == want {
                        walk(w, rest, out)?;
                    } else {
                        skip_value(w)?;
                    }
                }
            } else {
                for _ in 0..len {
                    skip_value(w)?;
                }
            }
            Ok(())
        }
        // Scalars cannot contain a path segment.
        _ => skip_value(w),
    }
}

fn read_value(w: &mut Walker<'_>) -> Result<Value> {
    let marker = w.marker()?;
    Ok(match marker {
        Marker::Null => Value::Nil,
        Marker::True => Value::Bool(true),
        Marker::False => Value::Bool(false),
        Marker::FixPos(v) => Value::UInt(u64::from(v)),
        Marker::FixNeg(v) => Value::Int(i64::from(v)),
        Marker::U8 => Value::UInt(u64::from(w.u8()?)),
        Marker::U16 => Value::UInt(u64::from(w.u16()?)),
        Marker::U32 => Value::UInt(u64::from(w.u32()?)),
        Marker::U64 => Value::UInt(w.u64()?),
        Marker::I8 => Value::Int(i64::from(w.u8()? as i8)),
        Marker::I16 => Value::Int(i64::from(w.u16()? as i16)),
        Marker::I32 => Value::Int(i64::from(w.u32()? as i32)),
        Marker::I64 => Value::Int(w.u64()? as i64),
        Marker::F32 => Value::F32(f32::from_bits(w.u32()?)),
        Marker::F64 => Value::F64(f64::from_bits(w.u64()?)),
        Marker::FixStr(len) => Value::Str(w.str_bytes(usize::from(len))?.to_owned()),
        Marker::Str8 => {
            let len = w.u8()?;
            Value::Str(w.str_bytes(usize::from(len))?.to_owned())
        }
        Marker::Str16 => {
            let len = w.u16()?;
            Value::Str(w.str_bytes(usize::from(len))?.to_owned())
        }
        Marker::Str32 => {
            let len = w.u32()?;
            Value::Str(w.str_bytes(len as usize)?.to_owned())
        }
        Marker::Bin8 => {
            let len = w.u8()?;
            Value::Bytes(w.take(usize::from(len))?.to_vec())
        }
        Marker::Bin16 => {
            let len = w.u16()?;
            Value::Bytes(w.take(usize::from(len))?.to_vec())
        }
        Marker::Bin32 => {
            let len = w.u32()?;
            Value::Bytes(w.take(len as usize)?.to_vec())
        }
        Marker::FixArray(len) => read_array(w, u32::from(len))?,
        Marker::Array16 => {
            let len = w.u16()?;
            read_array(w, u32::from(len))?
        }
        Marker::Array32 => {
            let len = w.u32()?;
            read_array(w, len)?
        }
        Marker::FixMap(len) => read_map(w, u32::from(len))?,
        Marker::Map16 => {
            let len = w.u16()?;
            read_map(w, u32::from(len))?
        }
        Marker::Map32 => {
            let len = w.u32()?;
            read_map(w, len)?
        }
        Marker::FixExt1 => read_ext(w, 1)?,
        Marker::FixExt2 => read_ext(w, 2)?,
        Marker::FixExt4 => read_ext(w, 4)?,
        Marker::FixExt8 => read_ext(w, 8)?,
        Marker::FixExt16 => read_ext(w, 16)?,
        Marker::Ext8 => {
            let len = w.u8()?;
            read_ext(w, usize::from(len))?
        }
        Marker::Ext16 => {
            let len = w.u16()?;
            read_ext(w, usize::from(len))?
        }
        Marker::Ext32 => {
            let len = w.u32()?;
            read_ext(w, len as usize)?
        }
        Marker::Reserved => {
            return Err(Error::Codec("reserved msgpack marker".into()));
        }
    })
}

fn read_array(w: &mut Walker<'_>, len: u32) -> Result<Value> {
    let mut items = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        items.push(read_value(w)?);
    }
    Ok(Value::Array(items))
}

fn read_map(w: &mut Walker<'_>, len: u32) -> Result<Value> {
    let mut pairs = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        let key = read_str(w)?.to_owned();
        pairs.push((key, read_value(w)?));
    }
    Ok(Value::Map(pairs))
}

fn read_ext(w: &mut Walker<'_>, len: usize) -> Result<Value> {
    let ext_type = w.u8()? as i8;
    let payload = w.take(len)?;
    if ext_type == TIMESTAMP_EXT {
        return decode_timestamp(payload);
    }
    Ok(Value::Bytes(payload.to_vec()))
}

fn decode_timestamp(payload: &[u8]) -> Result<Value> {
    match payload.len() {
        4 => {
            let secs = u32::from_be_bytes(payload.try_into().unwrap());
            Ok(Value::Time {
                secs: i64::from(secs),
                nanos: 0,
            })
        }
        8 => {
            let packed = u64::from_be_bytes(payload.try_into().unwrap());
            Ok(Value::Time {
                secs: (packed & ((1 << 34) - 1)) as i64,
                nanos: (packed >> 34) as u32,
            })
        }
        12 => {
            let nanos = u32::from_be_bytes(payload[..4].try_into().unwrap());
            let secs = i64::from_be_bytes(payload[4..].try_into().unwrap());
            Ok(Value::Time { secs, nanos })
        }
        other => Err(Error::Codec(format!(
            "timestamp extension with invalid length {other}"
        ))),
    }
}

fn skip_value(w: &mut Walker<'_>) -> Result<()> {
    let marker = w.marker()?;
    match marker {
        Marker::Null
        | Marker::True
        | Marker::False
        | Marker::FixPos(_)
        | Marker::FixNeg(_) => {}
        Marker::U8 | Marker::I8 => {
            w.take(1)?;
        }
        Marker::U16 | Marker::I16 => {
            w.take(2)?;
        }
        Marker::U32 | Marker::I32 | Marker::F32 => {
            w.take(4)?;
        }
        Marker::U64 | Marker::I64 | Marker::F64 => {
            w.take(8)?;
        }
        Marker::FixStr(len) => {
            w.take(usize::from(len))?;
        }
        Marker::Str8 | Marker::Bin8 => {
            let len = w.u8()?;
            w.take(usize::from(len))?;
        }
        Marker::Str16 | Marker::Bin16 => {
            let len = w.u16()?;
            w.take(usize::from(len))?;
        }
        Marker::Str32 | Marker::Bin32 => {
            let len = w.u32()?;
            w.take(len as usize)?;
        }
        Marker::FixArray(len) => skip_values(w, u32::from(len))?,
        Marker::Array16 => {
            let len = w.u16()?;
            skip_values(w, u32::from(len))?;
        }
        Marker::Array32 => {
            let len = w.u32()?;
            skip_values(w, len)?;
        }
        Marker::FixMap(len) => skip_values(w, u32::from(len) * 2)?,
        Marker::Map16 => {
            let len = w.u16()?;
            skip_values(w, u32::from(len) * 2)?;
        }
        Marker::Map32 => {
            let len = w.u32()?;
            len.checked_mul(2)
                .map_or(Err(Error::Codec("oversized map".into())), |n| {
                    skip_values(w, n)
                })?;
        }
        Marker::FixExt1 => {
            w.take(2)?;
        }
        Marker::FixExt2 => {
            w.take(3)?;
        }
        Marker::FixExt4 => {
            w.take(5)?;
        }
        Marker::FixExt8 => {
            w.take(9)?;
        }
        Marker::FixExt16 => {
            w.take(17)?;
        }
        Marker::Ext8 => {
            let len = w.u8()?;
            w.take(usize::from(len) + 1)?;
        }
        Marker::Ext16 => {
            let len = w.u16()?;
            w.take(usize::from(len) + 1)?;
        }
        Marker::Ext32 => {
            let len = w.u32()?;
            w.take(len as usize + 1)?;
        }
        Marker::Reserved => {
            return Err(Error::Codec("reserved msgpack marker".into()));
        }
    }
    Ok(())
}

fn skip_values(w: &mut Walker<'_>, count: u32) -> Result<()> {
    for _ in 0..count {
        skip_value(w)?;
    }
    Ok(())
}

fn read_map_len(w: &mut Walker<'_>) -> Result<u32> {
    match w.marker()? {
        Marker::FixMap(len) => Ok(u32::from(len)),
        Marker::Map16 => Ok(u32::from(w.u16()?)),
        Marker::Map32 => w.u32(),
        other => Err(Error::Codec(format!("expected map, found {other:?}"))),
    }
}

fn read_array_len(w: &mut Walker<'_>) -> Result<u32> {
    match w.marker()? {
        Marker::FixArray(len) => Ok(u32::from(len)),
        Marker::Array16 => Ok(u32::from(w.u16()?)),
        Marker::Array32 => w.u32(),
        other => Err(Error::Codec(format!("expected array, found {other:?}"))),
    }
}

fn read_str<'a>(w: &mut Walker<'a>) -> Result<&'a str> {
    let len = match w.marker()? {
        Marker::FixStr(len) => usize::from(len),
        Marker::Str8 => usize::from(w.u8()?),
        Marker::Str16 => usize::from(w.u16()?),
        Marker::Str32 => w.u32()? as usize,
        other => {
            return Err(Error::Codec(format!(
                "expected string map key, found {other:?}"
            )));
        }
    };
    w.str_bytes(len)
}

struct Walker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Walker<'a> {
    fn new(buf: &'a [u8]) -> Walker<'a> {
        Walker { buf, pos: 0 }
    }

    fn peek(&self) -> Result<Marker> {
        self.buf
            .get(self.pos)
            .map(|&b| Marker::from_u8(b))
            .ok_or_else(truncated)
    }

    fn marker(&mut self) -> Result<Marker> {
        Ok(Marker::from_u8(self.u8()?))
    }

    fn u8(&mut self) -> Result<u8> {
        let byte = *self.buf.get(self.pos).ok_or_else(truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn str_bytes(&mut self, len: usize) -> Result<&'a str> {
        std::str::from_utf8(self.take(len)?)
            .map_err(|err| Error::Codec(format!("invalid utf-8 in string: {err}")))
    }
}

fn truncated() -> Error {
    Error::Codec("truncated document".into())
}
