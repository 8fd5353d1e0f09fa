//! CloudStack API request signing.
//!
//! Signed backend commands carry an `apikey` and a `signature` parameter.
//! The signature is derived from the complete parameter set:
//! 1. Lower-case every key and sort by it
//! 2. Form-encode every value (space becomes `+`)
//! 3. Join as `key=value` pairs with `&` and lower-case the whole string
//! 4. HMAC-SHA1 the result with the user's secret key, Base64 the digest
//!
//! The backend recomputes the same string on its side, so any deviation
//! shows up as a backend-side authentication failure, not a local error.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::Sha1;
use std::collections::BTreeMap;

type HmacSha1 = Hmac<Sha1>;

/// Name of the parameter that carries the signature itself.
pub const SIGNATURE_PARAM: &str = "signature";

/// Form-encoding set: everything except unreserved characters. Space is
/// encoded as `%20` here and rewritten to `+` afterwards.
const FORM_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Form-encode a single value the way `application/x-www-form-urlencoded`
/// does: unreserved characters pass through, space becomes `+`, everything
/// else becomes uppercase `%XX` per UTF-8 byte.
pub fn form_encode(value: &str) -> String {
    // A literal `+` is already `%2B` at this point, so the rewrite only
    // touches spaces.
    utf8_percent_encode(value, FORM_ENCODE_SET)
        .to_string()
        .replace("%20", "+")
}

/// Build the canonical string that gets signed.
///
/// Keys are lower-cased and sorted. The `signature` parameter is never part
/// of its own input and is skipped if present. When two keys collide after
/// lower-casing, the one that sorts last by original key wins.
pub fn canonical_query<'a, I>(params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut sorted: BTreeMap<String, &str> = BTreeMap::new();
    let mut originals: Vec<(&str, &str)> = params
        .into_iter()
        .filter(|(k, _)| !k.eq_ignore_ascii_case(SIGNATURE_PARAM))
        .collect();
    originals.sort();
    for (key, value) in originals {
        sorted.insert(key.to_lowercase(), value);
    }

    sorted
        .iter()
        .map(|(k, v)| format!("{k}={}", form_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
        .to_lowercase()
}

/// Compute the CloudStack signature for `params` under `secret_key`.
pub fn sign<'a, I>(params: I, secret_key: &str) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let canonical = canonical_query(params);
    let mut mac =
        HmacSha1::new_from_slice(secret_key.as_bytes()).expect("HMAC can take key of any size");
    mac.update(canonical.as_bytes());
    BASE64_STANDARD.encode(mac.finalize().into_bytes())
}
