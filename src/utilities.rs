// Copyright 2024 The matrix-e2ee Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use base64::{
    engine::general_purpose::STANDARD_NO_PAD, DecodeError as Base64DecodeError, Engine,
};
use ruma::{CanonicalJsonError, CanonicalJsonValue};
use serde_json::Value;

/// Encode the input as unpadded base64, the encoding every Matrix key and
/// signature uses on the wire.
pub fn encode(input: impl AsRef<[u8]>) -> String {
    STANDARD_NO_PAD.encode(input)
}

/// Decode unpadded base64 into a byte vector.
pub fn decode(input: impl AsRef<[u8]>) -> Result<Vec<u8>, Base64DecodeError> {
    STANDARD_NO_PAD.decode(input)
}

/// Serialize a JSON value into its canonical form: sorted keys, minimal
/// whitespace.
pub fn canonical_json(value: &Value) -> Result<String, CanonicalJsonError> {
    Ok(CanonicalJsonValue::try_from(value.clone())?.to_string())
}

/// Canonicalize a JSON object for signing or signature verification.
///
/// The `signatures` and `unsigned` fields are not covered by Matrix object
/// signatures and are stripped before canonicalization.
pub fn canonical_json_for_signing(value: &Value) -> Result<String, CanonicalJsonError> {
    let mut value = value.clone();

    if let Some(object) = value.as_object_mut() {
        object.remove("signatures");
        object.remove("unsigned");
    }

    Ok(CanonicalJsonValue::try_from(value)?.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{canonical_json, canonical_json_for_signing, decode, encode};

    #[test]
    fn base64_has_no_padding() {
        assert_eq!(encode(b"A"), "QQ");
        assert_eq!(decode("QQ").unwrap(), b"A");
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({ "b": 1, "a": { "d": 2, "c": 3 } });
        assert_eq!(canonical_json(&value).unwrap(), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn signing_strips_signatures_and_unsigned() {
        let value = json!({
            "key": "abc",
            "signatures": { "@alice:example.org": {} },
            "unsigned": { "age": 4 },
        });

        assert_eq!(canonical_json_for_signing(&value).unwrap(), r#"{"key":"abc"}"#);
    }
}
