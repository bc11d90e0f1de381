/// The bincode configuration used for every persisted blob: little-endian, fixed-width integers,
/// and a hard size limit so that a corrupt length prefix cannot trigger a huge allocation.
#[macro_export]
macro_rules! bincode_config {
    () => {
        ::bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding()
            .with_limit::<{ 100 * 1024 * 1024 }>()
    };
}

/// Encode a value with [`bincode_config!`].
///
/// # Errors
///
/// Propagates any error from the bincode encoder.
pub fn encode_to_vec<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::encode_to_vec(value, bincode_config!())
}

/// Decode a value with [`bincode_config!`], requiring that the whole slice is consumed.
///
/// # Errors
///
/// Propagates any error from the bincode decoder, and returns
/// [`DecodeError::OtherString`](bincode::error::DecodeError::OtherString) if bytes remain.
pub fn decode_from_slice<T: bincode::Decode<()>>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    let (value, len) = bincode::decode_from_slice(bytes, bincode_config!())?;
    if len != bytes.len() {
        return Err(bincode::error::DecodeError::OtherString(format!(
            "{} trailing bytes after decoded value",
            bytes.len() - len
        )));
    }

    Ok(value)
}
