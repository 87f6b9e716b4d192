//! Trace persistence: an append-only trace directory holding five
//! independently compressed substreams plus a version file and the initial
//! process parameters.

pub mod compressed_reader;
pub mod compressed_writer;
pub mod trace_frame;
pub mod trace_reader;
pub mod trace_stream;
pub mod trace_task_event;
pub mod trace_writer;

use std::io::{Read, Result, Write};

// The substreams are plain byte streams; these helpers fix the wire width of
// the primitive fields. Everything is little-endian, the only byte order the
// supported architectures have.

pub(crate) fn write_u8(w: &mut dyn Write, v: u8) -> Result<()> {
    w.write_all(&[v])
}

pub(crate) fn write_u32(w: &mut dyn Write, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn write_u64(w: &mut dyn Write, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn write_i32(w: &mut dyn Write, v: i32) -> Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn write_i64(w: &mut dyn Write, v: i64) -> Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn write_f64(w: &mut dyn Write, v: f64) -> Result<()> {
    w.write_all(&v.to_bits().to_le_bytes())
}

pub(crate) fn write_bytes(w: &mut dyn Write, v: &[u8]) -> Result<()> {
    write_u32(w, v.len() as u32)?;
    w.write_all(v)
}

pub(crate) fn read_u8(r: &mut dyn Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub(crate) fn read_u32(r: &mut dyn Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64(r: &mut dyn Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn read_i32(r: &mut dyn Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub(crate) fn read_i64(r: &mut dyn Read) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub(crate) fn read_f64(r: &mut dyn Read) -> Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_bits(u64::from_le_bytes(buf)))
}

pub(crate) fn read_bytes(r: &mut dyn Read) -> Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn primitive_round_trips() {
        let mut buf: Vec<u8> = Vec::new();
        write_u8(&mut buf, 7).unwrap();
        write_u32(&mut buf, 0xdead_beef).unwrap();
        write_u64(&mut buf, u64::max_value()).unwrap();
        write_i64(&mut buf, -42).unwrap();
        write_f64(&mut buf, 1.5).unwrap();
        write_bytes(&mut buf, b"hello").unwrap();

        let mut r: &[u8] = &buf;
        assert_eq!(7, read_u8(&mut r).unwrap());
        assert_eq!(0xdead_beef, read_u32(&mut r).unwrap());
        assert_eq!(u64::max_value(), read_u64(&mut r).unwrap());
        assert_eq!(-42, read_i64(&mut r).unwrap());
        assert_eq!(1.5, read_f64(&mut r).unwrap());
        assert_eq!(b"hello".to_vec(), read_bytes(&mut r).unwrap());
        assert!(r.is_empty());
    }
}
