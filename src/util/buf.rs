use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

//TODO convenience for serializing / deserializing collections

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    let s = String::from_utf8(raw)?;
    Ok(s)
}

/// length-prefixed byte string, the length being varint encoded
pub fn put_bytes(buf: &mut impl BufMut, data: &[u8]) {
    buf.put_usize_varint(data.len());
    buf.put_slice(data);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Vec<u8>> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        bail!("buffer underflow: expected {} bytes, {} remaining", len, buf.remaining());
    }
    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);
    Ok(result)
}

pub fn try_get_array<const N: usize>(buf: &mut impl Buf) -> anyhow::Result<[u8; N]> {
    if buf.remaining() < N {
        bail!("buffer underflow: expected {} bytes, {} remaining", N, buf.remaining());
    }
    let mut result = [0u8; N];
    buf.copy_to_slice(&mut result);
    Ok(result)
}

pub fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        b => bail!("invalid boolean value {}", b),
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use crate::util::buf::*;

    #[rstest]
    #[case::empty("", vec![0])]
    #[case::a("a", vec![1,97])]
    #[case::abc("abc", vec![3,97,98,99])]
    #[case::umlaut("ä", vec![2,0xc3,0xa4])]
    fn test_put_string(#[case] s: &str, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        assert_eq!(&buf, &expected);

        let mut b: &[u8] = &buf;
        let deser = try_get_string(&mut b).unwrap();
        assert_eq!(s, deser);
        assert!(b.is_empty());
    }

    #[test]
    fn test_try_get_bytes_underflow() {
        let mut b: &[u8] = &[5, 1, 2];
        assert!(try_get_bytes(&mut b).is_err());
    }

    #[test]
    fn test_try_get_array() {
        let mut b: &[u8] = &[1, 2, 3, 4];
        assert_eq!(try_get_array::<3>(&mut b).unwrap(), [1, 2, 3]);
        assert!(try_get_array::<3>(&mut b).is_err());
    }

    #[rstest]
    #[case(0, Some(false))]
    #[case(1, Some(true))]
    #[case(2, None)]
    fn test_try_get_bool(#[case] raw: u8, #[case] expected: Option<bool>) {
        let mut b: &[u8] = &[raw];
        assert_eq!(try_get_bool(&mut b).ok(), expected);
    }
}
