use serde::{Deserialize, Serialize};

/// The status of a payment.
///
/// ```text
/// Ready ──approve──► Paid ──refund──► Cancelled
///   │
///   └──decline / void──► Failed
/// ```
/// A failed refund leaves the payment in `Paid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Created from ORDER_CREATED, waiting for the buyer to confirm.
    #[default]
    Ready,
    Paid,
    /// Refunded.
    Cancelled,
    Failed,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 4] = [
        PaymentStatus::Ready,
        PaymentStatus::Paid,
        PaymentStatus::Cancelled,
        PaymentStatus::Failed,
    ];

    pub fn can_confirm(&self) -> bool {
        matches!(self, PaymentStatus::Ready)
    }

    pub fn can_refund(&self) -> bool {
        matches!(self, PaymentStatus::Paid)
    }

    pub fn can_void(&self) -> bool {
        matches!(self, PaymentStatus::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Cancelled | PaymentStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Ready => "READY",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        PaymentStatus::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
