use serde::{Deserialize, Serialize};
use serde_json::Value;
use tck_core::{
    access_nested, cast, flatten, FieldType, FieldValue, HarnessError, UCode, PATH_SEPARATOR,
};

use crate::normalize::{base64_str_to_bytes, latin1_string_to_bytes};

/// Fields the deserialized-address tables compare numerically.
const URI_INT_FIELDS: &[&str] = &["ue_id", "ue_version_major", "resource_id"];
/// Fields the deserialized-address tables compare byte-wise.
const URI_BYTES_FIELDS: &[&str] = &["authority.id", "authority.ip"];

/// One row of a `Field`/`Value` assertion table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyRow {
    #[serde(rename = "Field")]
    pub field: String,
    #[serde(rename = "Value")]
    pub value: String,
}

/// One row of a generic typed-field table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRow {
    #[serde(rename = "protobuf_field_names")]
    pub name: String,
    #[serde(rename = "protobuf_field_values")]
    pub value: String,
    #[serde(rename = "protobuf_field_type")]
    pub ty: String,
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn fail(expected: impl Into<String>, actual: impl Into<String>) -> HarnessError {
    HarnessError::AssertionFailure {
        expected: expected.into(),
        actual: actual.into(),
    }
}

/// Verifies a deserialized protocol address against its property table.
/// Rows with an empty expected value assert the field renders empty.
pub fn verify_uri_properties(data: &Value, rows: &[PropertyRow]) -> Result<(), HarnessError> {
    let flat = flatten(data, PATH_SEPARATOR);
    for row in rows {
        let actual = flat.get(&row.field).ok_or(HarnessError::PathNotFound {
            path: row.field.clone(),
        })?;
        let rendered = render(actual);
        if row.value.is_empty() {
            if !rendered.is_empty() {
                return Err(fail("<empty>", rendered));
            }
            continue;
        }
        if URI_INT_FIELDS.contains(&row.field.as_str()) {
            let expected: i64 =
                row.value
                    .parse()
                    .map_err(|_| HarnessError::TypeMismatch {
                        value: row.value.clone(),
                        expected: "int".to_string(),
                    })?;
            if actual.as_i64() != Some(expected) {
                return Err(fail(expected.to_string(), rendered));
            }
        } else if URI_BYTES_FIELDS.contains(&row.field.as_str()) {
            if rendered.as_bytes() != row.value.as_bytes() {
                return Err(fail(row.value.clone(), rendered));
            }
        } else if rendered != row.value {
            return Err(fail(row.value.clone(), rendered));
        }
    }
    Ok(())
}

/// Verifies a deserialized identifier against its property table. An empty
/// expected value requires the field to be absent; present fields compare
/// numerically.
pub fn verify_uuid_properties(data: &Value, rows: &[PropertyRow]) -> Result<(), HarnessError> {
    let flat = flatten(data, PATH_SEPARATOR);
    for row in rows {
        let actual = flat.get(&row.field);
        if row.value.is_empty() {
            if let Some(present) = actual {
                return Err(fail(
                    format!("field '{}' absent", row.field),
                    render(present),
                ));
            }
            continue;
        }
        let actual = actual.ok_or(HarnessError::PathNotFound {
            path: row.field.clone(),
        })?;
        let expected: i64 = row
            .value
            .parse()
            .map_err(|_| HarnessError::TypeMismatch {
                value: row.value.clone(),
                expected: "int".to_string(),
            })?;
        let actual_num = actual
            .as_i64()
            .or_else(|| render(actual).parse().ok())
            .ok_or_else(|| HarnessError::TypeMismatch {
                value: render(actual),
                expected: "int".to_string(),
            })?;
        if actual_num != expected {
            return Err(fail(expected.to_string(), actual_num.to_string()));
        }
    }
    Ok(())
}

/// Generic typed comparison of response fields against a scenario table.
/// Expected values are cast with the non-jsonable bytes mode so byte rows
/// compare octet-for-octet.
pub fn verify_set_fields(data: &Value, rows: &[FieldRow]) -> Result<(), HarnessError> {
    for row in rows {
        let expected = cast(&row.value, FieldType::parse(&row.ty)?, false)?;
        let actual = access_nested(data, &row.name)?;
        let matched = match &expected {
            FieldValue::Bytes(bytes) => actual
                .as_str()
                .map(|s| s.as_bytes() == bytes.as_slice())
                .unwrap_or(false),
            other => actual == other.to_json(),
        };
        if !matched {
            return Err(fail(expected.to_string(), render(&actual)));
        }
    }
    Ok(())
}

/// Compares the `result` field of a validation response. The literal
/// expected value `none` skips the check entirely.
pub fn check_validation_result(data: &Value, expected: &str) -> Result<(), HarnessError> {
    if expected == "none" {
        return Ok(());
    }
    check_data_field(data, "result", expected.trim())
}

pub fn check_validation_message(data: &Value, expected: &str) -> Result<(), HarnessError> {
    check_data_field(data, "message", expected.trim())
}

fn check_data_field(data: &Value, field: &str, expected: &str) -> Result<(), HarnessError> {
    let actual = access_nested(data, field)?;
    let rendered = render(&actual);
    if rendered != expected {
        return Err(fail(expected, rendered));
    }
    Ok(())
}

fn code_matches(actual: &Value, expected: UCode) -> bool {
    match actual.as_i64() {
        Some(n) => n == expected.code(),
        None => match actual.as_str() {
            // implementations report the code either numerically or by name
            Some(s) => s
                .parse::<i64>()
                .map(|n| n == expected.code())
                .unwrap_or_else(|_| s == expected.name()),
            None => false,
        },
    }
}

/// Checks a status field against a named protocol code; implementations
/// are free to report the number or the name.
pub fn check_status_code(data: &Value, field: &str, code_name: &str) -> Result<(), HarnessError> {
    let expected = UCode::from_name(code_name)?;
    let actual = access_nested(data, field)?;
    if !code_matches(&actual, expected) {
        return Err(fail(
            format!("{} ({})", expected.name(), expected.code()),
            render(&actual),
        ));
    }
    Ok(())
}

pub(crate) fn expect_code_ok(code: &Value) -> Result<(), HarnessError> {
    if code_matches(code, UCode::Ok) {
        Ok(())
    } else {
        Err(fail("OK (0)", render(code)))
    }
}

/// Plain string equality for serialized URI/UUID responses.
pub fn check_serialized_equals(actual: &Value, expected: &str) -> Result<(), HarnessError> {
    let rendered = render(actual);
    if rendered != expected {
        return Err(fail(expected, rendered));
    }
    Ok(())
}

/// Compares a micro-serialized response (latin-1 string on the wire)
/// against the expected bytes given as base64. `<empty>` means zero bytes.
pub fn check_micro_serialized(actual: &Value, expected_b64: &str) -> Result<(), HarnessError> {
    let expected_b64 = if expected_b64 == "<empty>" { "" } else { expected_b64 };
    let expected = base64_str_to_bytes(expected_b64)?;
    let actual_str = actual.as_str().ok_or_else(|| HarnessError::TypeMismatch {
        value: actual.to_string(),
        expected: "string".to_string(),
    })?;
    let actual_bytes = latin1_string_to_bytes(actual_str)?;
    if actual_bytes != expected {
        return Err(fail(format!("{expected:?}"), format!("{actual_bytes:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::bytes_to_latin1_string;
    use serde_json::json;

    #[test]
    fn validation_result_compares_and_names_both_values() {
        let data = json!({"result": "OK"});
        check_validation_result(&data, "OK").unwrap();
        check_validation_result(&data, "none").unwrap();

        let err = check_validation_result(&data, "FAIL").expect_err("mismatch must fail");
        let msg = err.to_string();
        assert!(msg.contains("FAIL"), "message should name expected: {msg}");
        assert!(msg.contains("OK"), "message should name actual: {msg}");
    }

    #[test]
    fn validation_message_trims_expected() {
        let data = json!({"message": "uri is empty"});
        check_validation_message(&data, " uri is empty ").unwrap();
    }

    #[test]
    fn status_codes_match_by_number_or_name() {
        check_status_code(&json!({"code": 0}), "code", "OK").unwrap();
        check_status_code(&json!({"code": "0"}), "code", "OK").unwrap();
        check_status_code(&json!({"code": "NOT_FOUND"}), "code", "NOT_FOUND").unwrap();
        assert!(check_status_code(&json!({"code": 5}), "code", "OK").is_err());
        assert!(matches!(
            check_status_code(&json!({"code": 0}), "code", "BOGUS"),
            Err(HarnessError::UnknownStatusCode { .. })
        ));
    }

    #[test]
    fn uri_property_table_types_fields() {
        let data = json!({
            "ue_id": 1234,
            "ue_version_major": 1,
            "resource_id": 0,
            "authority": {"id": "vcu.example", "ip": ""}
        });
        let rows = vec![
            PropertyRow { field: "ue_id".into(), value: "1234".into() },
            PropertyRow { field: "authority.id".into(), value: "vcu.example".into() },
            PropertyRow { field: "authority.ip".into(), value: "".into() },
        ];
        verify_uri_properties(&data, &rows).unwrap();

        let bad = vec![PropertyRow { field: "ue_id".into(), value: "99".into() }];
        assert!(verify_uri_properties(&data, &bad).is_err());

        let missing = vec![PropertyRow { field: "authority.name".into(), value: "x".into() }];
        assert!(matches!(
            verify_uri_properties(&data, &missing),
            Err(HarnessError::PathNotFound { .. })
        ));
    }

    #[test]
    fn uuid_property_table_checks_presence_and_numbers() {
        let data = json!({"msb": 112233, "lsb": "445566"});
        let rows = vec![
            PropertyRow { field: "msb".into(), value: "112233".into() },
            PropertyRow { field: "lsb".into(), value: "445566".into() },
            PropertyRow { field: "variant".into(), value: "".into() },
        ];
        verify_uuid_properties(&data, &rows).unwrap();

        let unexpected_presence = vec![PropertyRow { field: "msb".into(), value: "".into() }];
        assert!(verify_uuid_properties(&data, &unexpected_presence).is_err());
    }

    #[test]
    fn set_fields_table_casts_before_comparing() {
        let data = json!({
            "attributes": {"ttl": 1000, "priority": "CS4"},
            "code": 5,
            "payload": "raw-bytes"
        });
        let rows = vec![
            FieldRow { name: "attributes.ttl".into(), value: "1000".into(), ty: "int".into() },
            FieldRow { name: "attributes.priority".into(), value: "CS4".into(), ty: "str".into() },
            FieldRow { name: "code".into(), value: "UCode.NOT_FOUND".into(), ty: "int".into() },
            FieldRow { name: "payload".into(), value: "raw-bytes".into(), ty: "bytes".into() },
        ];
        verify_set_fields(&data, &rows).unwrap();

        let bad = vec![FieldRow {
            name: "attributes.ttl".into(),
            value: "2000".into(),
            ty: "int".into(),
        }];
        assert!(verify_set_fields(&data, &bad).is_err());
    }

    #[test]
    fn serialized_equality_is_exact() {
        check_serialized_equals(&json!("up://vcu/1234/1/0"), "up://vcu/1234/1/0").unwrap();
        assert!(check_serialized_equals(&json!("up://vcu/1/1/0"), "up://vcu/2/1/0").is_err());
    }

    #[test]
    fn micro_serialized_round_trips_latin1() {
        let bytes = vec![0x01u8, 0x00, 0xc0, 0xff];
        let wire = bytes_to_latin1_string(&bytes);
        let expected_b64 = crate::normalize::bytes_to_base64_str(&bytes);
        check_micro_serialized(&json!(wire), &expected_b64).unwrap();
        check_micro_serialized(&json!(""), "<empty>").unwrap();
        assert!(check_micro_serialized(&json!(wire), "AAECAw==").is_err());
    }
}
