//! Passport record decoding.
//! Parses the `|`-delimited text payload delivered over the data
//! characteristic into a [`PassportData`] record.

use log::debug;

use crate::core::bluetooth::PassportData;
use crate::error::DecodeError;

/// Number of mandatory fields in a record payload.
const REQUIRED_FIELDS: usize = 8;

/// Decodes a data-characteristic payload.
///
/// The payload is UTF-8 text with fields in fixed order: document number,
/// surname, given names, nationality, date of birth, sex, expiry date,
/// uid, and an optional "true"/"false" photo flag. The uid field's text
/// bytes are taken verbatim (the firmware does not hex-encode it).
///
/// The framing has no checksum, length prefix, or escaping, so a `|`
/// inside a field value shifts everything after it; malformed input is
/// detected only by field count. Invalid UTF-8 is decoded lossily rather
/// than rejected.
pub fn parse_passport_record(payload: &[u8]) -> Result<PassportData, DecodeError> {
    let text = String::from_utf8_lossy(payload);
    let fields: Vec<&str> = text.split('|').collect();

    if fields.len() < REQUIRED_FIELDS {
        return Err(DecodeError::MalformedRecord {
            fields: fields.len(),
        });
    }

    let record = PassportData {
        document_number: fields[0].to_string(),
        surname: fields[1].to_string(),
        given_names: fields[2].to_string(),
        nationality: fields[3].to_string(),
        date_of_birth: fields[4].to_string(),
        sex: fields[5].to_string(),
        expiry_date: fields[6].to_string(),
        uid: fields[7].as_bytes().to_vec(),
        photo_available: fields
            .get(8)
            .map(|flag| flag.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    };
    debug!(
        "decoded passport record for document {}",
        record.document_number
    );
    Ok(record)
}
