use common::UserId;

/// The authenticated caller of a service operation.
///
/// Passed explicitly; there is no ambient security context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    /// A buyer acting on their own resources.
    User(UserId),
    /// Back-office staff; may act on any resource.
    Operator,
}

impl Principal {
    pub fn user(user_id: UserId) -> Self {
        Principal::User(user_id)
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Principal::User(id) => Some(*id),
            Principal::Operator => None,
        }
    }

    /// True if the caller may act on a resource owned by `owner`.
    pub fn can_access(&self, owner: UserId) -> bool {
        match self {
            Principal::User(id) => *id == owner,
            Principal::Operator => true,
        }
    }
}
