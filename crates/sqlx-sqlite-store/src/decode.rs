//! SQLite value to JSON decoding

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteValueRef;
use sqlx::{TypeInfo, Value, ValueRef};

/// Convert a raw SQLite value into JSON.
///
/// Integers keep full i64 precision, reals become JSON numbers (non-finite
/// values become null), and BLOBs are base64 encoded.
pub fn to_json(raw: SqliteValueRef<'_>) -> Result<JsonValue, sqlx::Error> {
   if raw.is_null() {
      return Ok(JsonValue::Null);
   }

   let value = ValueRef::to_owned(&raw);
   let decoded = match value.type_info().name() {
      "INTEGER" | "BOOLEAN" | "NUMERIC" => {
         let n: i64 = value.try_decode_unchecked()?;
         JsonValue::from(n)
      }
      "REAL" => {
         let n: f64 = value.try_decode_unchecked()?;
         serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
      }
      "BLOB" => {
         let bytes: Vec<u8> = value.try_decode_unchecked()?;
         JsonValue::String(STANDARD.encode(bytes))
      }
      _ => {
         let text: String = value.try_decode_unchecked()?;
         JsonValue::String(text)
      }
   };

   Ok(decoded)
}
