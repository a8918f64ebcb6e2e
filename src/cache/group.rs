use super::IdentityCache;
use crate::record::Group;

impl IdentityCache<Group> {
    /// Group name for display. `-1` stands for "no group".
    pub fn gid_to_name(&self, gid: i32) -> String {
        if gid == -1 {
            return "NoGroup".into();
        }
        self.id_to_name(gid).unwrap_or_else(|| "unknown".into())
    }

    /// `-1` if there is no such group.
    pub fn name_to_gid(&self, name: &str) -> i32 {
        self.name_to_id(name).unwrap_or(-1)
    }
}
