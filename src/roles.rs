/// The role strings the identity collaborator resolves for a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Vpi,
    Vpa,
    Dean,
    Teacher,
    Student,
    Parent,
    Registry,
    BusinessManager,
    ItPersonnel,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Role> {
        match raw {
            "admin" => Some(Role::Admin),
            "vpi" => Some(Role::Vpi),
            "vpa" => Some(Role::Vpa),
            "dean" => Some(Role::Dean),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            "parent" => Some(Role::Parent),
            "registry" => Some(Role::Registry),
            "business_manager" => Some(Role::BusinessManager),
            "it_personnel" => Some(Role::ItPersonnel),
            _ => None,
        }
    }

    /// Single point of role dispatch. Handlers consume the capability tag,
    /// never the raw role string, with one exception: unpublish requires the
    /// admin role itself, not the broader admin tier.
    pub fn capability(self) -> Capability {
        match self {
            Role::Admin | Role::Vpi | Role::Vpa | Role::Dean | Role::Registry => {
                Capability::AdminTier
            }
            Role::Teacher => Capability::Teacher,
            Role::Student => Capability::Student,
            Role::Parent => Capability::Parent,
            Role::BusinessManager | Role::ItPersonnel => Capability::Other,
        }
    }
}

/// Closed capability tag resolved once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    AdminTier,
    Teacher,
    Student,
    Parent,
    /// Staff roles with no academic visibility (business manager, IT).
    Other,
}

/// Transport-resolved caller identity carried on every authorized request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

impl Caller {
    pub fn capability(&self) -> Capability {
        self.role.capability()
    }
}
