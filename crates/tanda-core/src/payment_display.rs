use serde::Serialize;

use crate::contribution::PaymentMethod;
use crate::errors::EngineError;

/// Display artifact for paying a contribution. Never evidence of payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentDisplay {
    pub method: PaymentMethod,
    pub amount_minor: i64,
    pub amount_display: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deep_link: Option<String>,
    pub instructions: String,
}

pub fn payment_display(
    method: PaymentMethod,
    handle: Option<&str>,
    amount_minor: i64,
    memo: &str,
) -> Result<PaymentDisplay, EngineError> {
    if amount_minor <= 0 {
        return Err(EngineError::validation("amount_minor", "amount must be positive"));
    }
    let amount = format_minor(amount_minor);
    let handle = handle.map(str::trim).filter(|value| !value.is_empty());
    let memo = url_component(memo.trim());

    let (deep_link, instructions) = match method {
        PaymentMethod::Venmo => {
            let handle = require_handle(method, handle)?.trim_start_matches('@');
            let path = url_component(handle);
            (
                Some(format!(
                    "https://venmo.com/{path}?txn=pay&amount={amount}&note={memo}"
                )),
                format!("Pay ${amount} to @{handle} on Venmo."),
            )
        }
        PaymentMethod::CashApp => {
            let handle = require_handle(method, handle)?.trim_start_matches('$');
            let path = url_component(handle);
            (
                Some(format!("https://cash.app/${path}/{amount}")),
                format!("Pay ${amount} to ${handle} on Cash App."),
            )
        }
        PaymentMethod::PayPal => {
            let handle = require_handle(method, handle)?;
            let path = url_component(handle);
            (
                Some(format!("https://paypal.me/{path}/{amount}USD")),
                format!("Send ${amount} to {handle} with PayPal."),
            )
        }
        PaymentMethod::Zelle => {
            let handle = require_handle(method, handle)?;
            (
                None,
                format!("Send ${amount} with Zelle to {handle} from your banking app."),
            )
        }
        PaymentMethod::Cash => (
            None,
            format!("Hand ${amount} in cash to the pool admin and ask them to verify it."),
        ),
        PaymentMethod::Other => (
            None,
            match handle {
                Some(handle) => format!("Pay ${amount} to {handle} as agreed with your pool."),
                None => format!("Pay ${amount} as agreed with your pool admin."),
            },
        ),
    };

    Ok(PaymentDisplay {
        method,
        amount_minor,
        amount_display: format!("${amount}"),
        deep_link,
        instructions,
    })
}

fn require_handle(method: PaymentMethod, handle: Option<&str>) -> Result<&str, EngineError> {
    handle.ok_or_else(|| {
        EngineError::validation(
            "handle",
            format!("{} payments need the recipient's handle", method.as_str()),
        )
    })
}

/// Formats minor units as a two-decimal string without floating point.
pub fn format_minor(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let absolute = amount_minor.unsigned_abs();
    format!("{sign}{}.{:02}", absolute / 100, absolute % 100)
}

fn url_component(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}
