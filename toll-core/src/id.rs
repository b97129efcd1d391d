use ulid::Ulid;

pub const ACCOUNT: &str = "acc";
pub const AGENT: &str = "agt";
pub const WALLET: &str = "wal";
pub const POLICY: &str = "pol";
pub const SERVICE: &str = "svc";
pub const SERVICE_PRICING: &str = "spr";
pub const INVOICE: &str = "inv";
pub const TRANSACTION: &str = "txn";
pub const AUDIT: &str = "aud";
pub const RATE_SNAPSHOT: &str = "rts";
pub const SUBMISSION: &str = "sub";
pub const CHECKOUT: &str = "cks";

/// Generates an id of the form `<prefix>_<ULID>`
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix_and_ulid_payload() {
        let id = new_id(ACCOUNT);

        let (prefix, payload) = id.split_once('_').unwrap();

        assert_eq!(prefix, "acc");

        assert_eq!(payload.len(), 26);

        assert!(payload.parse::<Ulid>().is_ok());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_id(WALLET), new_id(WALLET));
    }
}
