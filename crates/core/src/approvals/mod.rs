use std::collections::{HashMap, HashSet};

/// Answers whether an actor holds a role. Role membership is owned elsewhere;
/// the engine only consumes this capability.
pub trait RoleDirectory: Send + Sync {
    fn has_role(&self, actor_id: &str, role_id: &str) -> Result<bool, String>;
}

impl<T> RoleDirectory for &T
where
    T: RoleDirectory + ?Sized,
{
    fn has_role(&self, actor_id: &str, role_id: &str) -> Result<bool, String> {
        (**self).has_role(actor_id, role_id)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryRoleDirectory {
    members_by_role: HashMap<String, HashSet<String>>,
}

impl InMemoryRoleDirectory {
    pub fn from_members<I, R, M>(roles: I) -> Self
    where
        I: IntoIterator<Item = (R, M)>,
        R: AsRef<str>,
        M: IntoIterator,
        M::Item: AsRef<str>,
    {
        let mut directory = Self::default();
        for (role_id, members) in roles {
            for actor_id in members {
                directory.grant(role_id.as_ref(), actor_id.as_ref());
            }
        }
        directory
    }

    pub fn grant(&mut self, role_id: &str, actor_id: &str) {
        self.members_by_role
            .entry(normalize_key(role_id))
            .or_default()
            .insert(normalize_key(actor_id));
    }

    pub fn role_count(&self) -> usize {
        self.members_by_role.len()
    }
}

impl RoleDirectory for InMemoryRoleDirectory {
    fn has_role(&self, actor_id: &str, role_id: &str) -> Result<bool, String> {
        Ok(self
            .members_by_role
            .get(&normalize_key(role_id))
            .is_some_and(|members| members.contains(&normalize_key(actor_id))))
    }
}

fn normalize_key(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}
