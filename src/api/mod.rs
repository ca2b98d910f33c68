pub mod admin_p9;
pub mod p9;
