//! Id generation. VM ids, task ids, and queued-op ids are all UUIDv4
//! strings — spec §3's "VM uniqueness" invariant only requires uniqueness
//! within a manager's lifetime, which a UUID trivially provides.

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
