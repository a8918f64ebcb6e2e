use super::IdentityCache;
use super::Result;
use crate::record::User;

impl IdentityCache<User> {
    pub fn primary_gid(&self, uid: i32) -> Result<i32> {
        self.lookup_id(uid).map(|u| u.primary_gid)
    }

    pub fn set_primary_gid(&self, uid: i32, gid: i32) -> Result<()> {
        self.modify(uid, |user| user.primary_gid = gid).map(|_| ())
    }

    /// Returns `false` if the user already had the mask.
    pub fn add_ip_mask(&self, uid: i32, mask: &str) -> Result<bool> {
        let mut added = false;
        self.modify(uid, |user| added = user.ip_masks.insert(mask))?;
        Ok(added)
    }

    /// Returns `false` if the user had no such mask.
    pub fn del_ip_mask(&self, uid: i32, mask: &str) -> Result<bool> {
        let mut removed = false;
        self.modify(uid, |user| removed = user.ip_masks.remove(mask))?;
        Ok(removed)
    }

    /// Is an `ident@address` pair allowed by the masks of any user?
    pub fn ident_ip_allowed(&self, ident_address: &str) -> bool {
        self.records
            .read()
            .values()
            .any(|user| user.ident_ip_allowed(ident_address))
    }

    /// Is an `ident@address` pair allowed by the masks of one particular user? Unknown users have no masks.
    pub fn ident_ip_allowed_for(&self, ident_address: &str, uid: i32) -> bool {
        self.records
            .read()
            .get(&uid)
            .is_some_and(|user| user.ident_ip_allowed(ident_address))
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::tests::flush;
    use crate::cache::tests::setup;
    use crate::cache::IdentityCache;
    use crate::error::CacheError;
    use crate::record::User;

    #[test]
    fn masks_and_groups() {
        let (db, pool) = setup();
        let users = IdentityCache::<User>::new(pool.clone(), "updatelog");
        let alice = users.create("alice").unwrap();
        let bob = users.create("bob").unwrap();

        assert_eq!(users.primary_gid(alice), Ok(-1));
        users.set_primary_gid(alice, 3).unwrap();
        assert_eq!(users.primary_gid(alice), Ok(3));

        assert!(users.add_ip_mask(alice, "*@192.168.0.*").unwrap());
        assert!(!users.add_ip_mask(alice, "*@192.168.0.*").unwrap());
        assert!(users.add_ip_mask(bob, "BOB@10.*").unwrap());

        assert!(users.ident_ip_allowed("anyone@192.168.0.7"));
        assert!(users.ident_ip_allowed("bob@10.0.0.1"));
        assert!(!users.ident_ip_allowed("bob@172.16.0.1"));
        assert!(users.ident_ip_allowed_for("bob@10.0.0.1", bob));
        assert!(!users.ident_ip_allowed_for("bob@10.0.0.1", alice));
        assert!(!users.ident_ip_allowed_for("bob@10.0.0.1", 99));

        assert!(users.del_ip_mask(bob, "BOB@10.*").unwrap());
        assert!(!users.del_ip_mask(bob, "BOB@10.*").unwrap());
        assert!(matches!(users.primary_gid(99), Err(CacheError::NotFound(_))));
        assert!(matches!(
            users.modify(alice, |u| u.name = "mallory".into()),
            Err(CacheError::Rejected(_))
        ));

        flush(&pool);
        let stored = db.documents("users");
        let alice_doc = stored.iter().find(|d| d["uid"] == alice).unwrap();
        assert_eq!(alice_doc["primary gid"], 3);
        assert_eq!(alice_doc["ip masks"], serde_json::json!(["*@192.168.0.*"]));
        assert_eq!(alice_doc["name"], "alice");
        pool.stop();
    }
}
