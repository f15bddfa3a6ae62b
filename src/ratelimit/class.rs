//! Operation classes shared between route wiring and the limiter.

/// Public traffic not scoped to a user.
pub const GENERAL: &str = "general";
pub const ORDER_CREATE: &str = "order_create";
pub const ORDER_READ: &str = "order_read";
/// Orders and payments.
pub const CRITICAL_ENDPOINTS: &str = "critical_endpoints";
pub const ADMIN_OPERATIONS: &str = "admin_operations";
pub const FILE_UPLOAD: &str = "file_upload";

/// A known operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    General,
    OrderCreate,
    OrderRead,
    CriticalEndpoints,
    AdminOperations,
    FileUpload,
}

impl OperationClass {
    pub const ALL: [OperationClass; 6] = [
        OperationClass::General,
        OperationClass::OrderCreate,
        OperationClass::OrderRead,
        OperationClass::CriticalEndpoints,
        OperationClass::AdminOperations,
        OperationClass::FileUpload,
    ];

    /// Parse a class name. Unknown names return `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            GENERAL => Some(OperationClass::General),
            ORDER_CREATE => Some(OperationClass::OrderCreate),
            ORDER_READ => Some(OperationClass::OrderRead),
            CRITICAL_ENDPOINTS => Some(OperationClass::CriticalEndpoints),
            ADMIN_OPERATIONS => Some(OperationClass::AdminOperations),
            FILE_UPLOAD => Some(OperationClass::FileUpload),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperationClass::General => GENERAL,
            OperationClass::OrderCreate => ORDER_CREATE,
            OperationClass::OrderRead => ORDER_READ,
            OperationClass::CriticalEndpoints => CRITICAL_ENDPOINTS,
            OperationClass::AdminOperations => ADMIN_OPERATIONS,
            OperationClass::FileUpload => FILE_UPLOAD,
        }
    }

    /// Prefix of store keys for this class.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            OperationClass::General => "general",
            OperationClass::OrderCreate => "order_create",
            OperationClass::OrderRead => "order_read",
            OperationClass::CriticalEndpoints => "critical",
            OperationClass::AdminOperations => "admin",
            OperationClass::FileUpload => "upload",
        }
    }

    /// Whether keys for this class carry the caller's identity.
    pub fn is_user_scoped(&self) -> bool {
        !matches!(self, OperationClass::General)
    }
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for class in OperationClass::ALL {
            assert_eq!(OperationClass::from_name(class.name()), Some(class));
        }
    }

    #[test]
    fn test_unknown_name() {
        assert_eq!(OperationClass::from_name("order-create"), None);
        assert_eq!(OperationClass::from_name(""), None);
    }

    #[test]
    fn test_only_general_is_not_user_scoped() {
        let scoped: Vec<_> = OperationClass::ALL
            .iter()
            .filter(|c| !c.is_user_scoped())
            .collect();
        assert_eq!(scoped, vec![&OperationClass::General]);
    }
}
