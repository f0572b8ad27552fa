use usbshare_core::{Account, HostProbe};

#[derive(Debug, Clone)]
pub struct SafetyContext {
    pub elevated: bool,
    pub owner: String,
    pub owner_account: Option<Account>,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub enum SafetyDecision {
    Allow(Account),
    Deny(String),
}

impl SafetyContext {
    pub fn probe<H: HostProbe + ?Sized>(host: &H, owner: &str, dry_run: bool) -> Self {
        Self {
            elevated: host.is_elevated(),
            owner: owner.to_string(),
            owner_account: host.lookup_account(owner),
            dry_run,
        }
    }
}

/// Decides whether a setup run may start. Dry runs do not need root, but the
/// owning account must exist either way.
pub fn can_modify_host(ctx: &SafetyContext) -> SafetyDecision {
    if !ctx.elevated && !ctx.dry_run {
        return SafetyDecision::Deny("Denied: setup must run as root (try sudo)".to_string());
    }

    let Some(account) = &ctx.owner_account else {
        return SafetyDecision::Deny(format!(
            "Denied: owning account {} does not exist on this host",
            ctx.owner
        ));
    };

    SafetyDecision::Allow(account.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use usbshare_core::sim::SimulatedHost;

    fn dan() -> Account {
        Account {
            name: "dan".to_string(),
            uid: 1000,
            gid: 1000,
        }
    }

    #[test]
    fn denies_without_root() {
        let ctx = SafetyContext {
            elevated: false,
            owner: "dan".to_string(),
            owner_account: Some(dan()),
            dry_run: false,
        };
        assert!(matches!(can_modify_host(&ctx), SafetyDecision::Deny(_)));
    }

    #[test]
    fn denies_missing_owner() {
        let ctx = SafetyContext {
            elevated: true,
            owner: "dan".to_string(),
            owner_account: None,
            dry_run: false,
        };
        match can_modify_host(&ctx) {
            SafetyDecision::Deny(reason) => assert!(reason.contains("dan")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn dry_run_allows_unprivileged() {
        let ctx = SafetyContext {
            elevated: false,
            owner: "dan".to_string(),
            owner_account: Some(dan()),
            dry_run: true,
        };
        assert!(matches!(can_modify_host(&ctx), SafetyDecision::Allow(_)));
    }

    #[test]
    fn allows_root_with_owner() {
        let host = SimulatedHost::new().with_account("dan", 1000, 1000);
        let ctx = SafetyContext::probe(&host, "dan", false);
        match can_modify_host(&ctx) {
            SafetyDecision::Allow(account) => assert_eq!(account, dan()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
