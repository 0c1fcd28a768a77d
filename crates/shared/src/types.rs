//! Cross-crate payment types

use serde::{Deserialize, Serialize};

/// Payment provider behind a normalized webhook event.
///
/// The two providers have structurally different payloads; the adapter
/// crates normalize both into the billing core's event model, so the core
/// only ever needs the provider as an attribution tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    Stripe,
    Creem,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::Stripe => "stripe",
            PaymentProvider::Creem => "creem",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stripe" => Some(PaymentProvider::Stripe),
            "creem" => Some(PaymentProvider::Creem),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_round_trips_through_str() {
        for provider in [PaymentProvider::Stripe, PaymentProvider::Creem] {
            assert_eq!(PaymentProvider::parse(provider.as_str()), Some(provider));
        }
        assert_eq!(PaymentProvider::parse("paypal"), None);
    }
}
