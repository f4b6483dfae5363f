pub mod tests {
    use crate::TenantScope;

    pub const TEST_CHAT_ID: &str = "1001";
    pub const TEST_SENDER_ID: &str = "7007";
    pub const TEST_OTHER_CHAT_ID: &str = "2002";

    pub fn private_scope() -> TenantScope {
        TenantScope::new(TEST_CHAT_ID, Some(TEST_SENDER_ID), false).unwrap()
    }

    pub fn group_scope() -> TenantScope {
        TenantScope::new(TEST_CHAT_ID, Some(TEST_SENDER_ID), true).unwrap()
    }

    pub fn other_tenant_scope() -> TenantScope {
        TenantScope::new(TEST_OTHER_CHAT_ID, Some(TEST_SENDER_ID), false).unwrap()
    }
}
