use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// User-facing text for the domain status codes, for clients that show
/// messages rather than interpreting codes.
pub fn user_message(code: &str) -> &'static str {
    match code {
        "login_failed" => "Username or password incorrect",
        "form_error" => "Enter the details",
        "user_exists" => "The username already exists, please try a new one",
        "roll_conflict" => "Roll number repeated",
        "phone_invalid" => "Phone number is incorrect",
        "selection_missing" => "Please select from the list",
        "class_assigned" => "That class already has a teacher",
        "already_taken" => "Attendance for this day is already taken",
        "unauthorized" => "You are not allowed to do that",
        "role_integrity" => "This account matches no known role",
        "sms_not_configured" => "The SMS gateway is not configured",
        _ => "Something went wrong",
    }
}
