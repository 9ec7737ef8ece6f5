use serde_json::Value;

use super::HttpResponse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success,
    RateLimitShort(String),
    RateLimitDaily(String),
    PermissionDenied(String),
    Transient(String),
    UriTooLong,
    Fatal(String),
}

// Graph API throttling codes (application, user, account, call volume).
const FACEBOOK_THROTTLE_CODES: &[i64] = &[4, 17, 32, 613, 80000, 80003, 80004, 80014];
// Permission and OAuth codes.
const FACEBOOK_PERMISSION_CODES: &[i64] = &[10, 102, 190];

const ADWORDS_PERMISSION_DENIED: &str = "USER_PERMISSION_DENIED";

/// Map a raw response to a single outcome class. This is the only place that
/// looks at status codes and platform error payloads.
pub fn classify(response: &HttpResponse) -> Classification {
    let json: Option<Value> = serde_json::from_str(&response.body).ok();

    if let Some(json) = &json {
        if let Some(c) = hubspot_rate_limit(json) {
            return c;
        }
        if response.status >= 400 {
            if let Some(c) = facebook_error(json) {
                return c;
            }
        }
    }

    if response.status >= 400 && response.body.contains(ADWORDS_PERMISSION_DENIED) {
        return Classification::PermissionDenied(summary(response));
    }

    match response.status {
        200..=299 => Classification::Success,
        401 | 403 => Classification::PermissionDenied(summary(response)),
        414 => Classification::UriTooLong,
        429 => Classification::RateLimitShort(summary(response)),
        408 | 500..=599 => Classification::Transient(summary(response)),
        _ => Classification::Fatal(summary(response)),
    }
}

/// HubSpot reports rate limits as `{"errorType": "RATE_LIMIT", "policyName": ...}`,
/// sometimes with a 200 status.
fn hubspot_rate_limit(json: &Value) -> Option<Classification> {
    if json.get("errorType").and_then(Value::as_str) != Some("RATE_LIMIT") {
        return None;
    }
    let policy = json
        .get("policyName")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let message = format!("hubspot rate limit, policy {policy}");
    if policy == "DAILY" {
        Some(Classification::RateLimitDaily(message))
    } else {
        Some(Classification::RateLimitShort(message))
    }
}

fn facebook_error(json: &Value) -> Option<Classification> {
    let error = json.get("error")?;
    let code = error.get("code").and_then(Value::as_i64)?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if FACEBOOK_THROTTLE_CODES.contains(&code) {
        Some(Classification::RateLimitShort(format!("facebook error {code}: {message}")))
    } else if FACEBOOK_PERMISSION_CODES.contains(&code) || (200..300).contains(&code) {
        Some(Classification::PermissionDenied(format!("facebook error {code}: {message}")))
    } else {
        None
    }
}

fn summary(response: &HttpResponse) -> String {
    let body: String = response.body.chars().take(300).collect();
    format!("status {}: {body}", response.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(status: u16, body: &str) -> HttpResponse {
        HttpResponse::new(status, body)
    }

    #[test]
    fn test_success() {
        assert_eq!(classify(&resp(200, r#"{"results": []}"#)), Classification::Success);
        assert_eq!(classify(&resp(201, "")), Classification::Success);
    }

    #[test]
    fn test_hubspot_ten_secondly_is_short() {
        let body = r#"{"status":"error","errorType":"RATE_LIMIT","policyName":"TEN_SECONDLY_ROLLING"}"#;
        assert!(matches!(classify(&resp(429, body)), Classification::RateLimitShort(_)));
        // Embedded in a 200 body as well
        assert!(matches!(classify(&resp(200, body)), Classification::RateLimitShort(_)));
    }

    #[test]
    fn test_hubspot_daily_is_daily() {
        let body = r#"{"status":"error","errorType":"RATE_LIMIT","policyName":"DAILY"}"#;
        assert!(matches!(classify(&resp(429, body)), Classification::RateLimitDaily(_)));
    }

    #[test]
    fn test_facebook_codes() {
        let throttled = r#"{"error":{"message":"User request limit reached","code":17}}"#;
        assert!(matches!(classify(&resp(400, throttled)), Classification::RateLimitShort(_)));

        let expired = r#"{"error":{"message":"Error validating access token","code":190}}"#;
        assert!(matches!(classify(&resp(400, expired)), Classification::PermissionDenied(_)));

        let other = r#"{"error":{"message":"Unsupported get request","code":100}}"#;
        assert!(matches!(classify(&resp(400, other)), Classification::Fatal(_)));
    }

    #[test]
    fn test_adwords_permission_denied() {
        let body = "<faultstring>[AuthorizationError.USER_PERMISSION_DENIED @ ; trigger:'<null>']</faultstring>";
        assert!(matches!(classify(&resp(500, body)), Classification::PermissionDenied(_)));
    }

    #[test]
    fn test_status_codes() {
        assert!(matches!(classify(&resp(401, "")), Classification::PermissionDenied(_)));
        assert!(matches!(classify(&resp(403, "")), Classification::PermissionDenied(_)));
        assert_eq!(classify(&resp(414, "")), Classification::UriTooLong);
        assert!(matches!(classify(&resp(429, "")), Classification::RateLimitShort(_)));
        assert!(matches!(classify(&resp(502, "bad gateway")), Classification::Transient(_)));
        assert!(matches!(classify(&resp(400, "bad")), Classification::Fatal(_)));
        assert!(matches!(classify(&resp(404, "")), Classification::Fatal(_)));
        assert!(matches!(classify(&resp(409, "")), Classification::Fatal(_)));
    }
}
