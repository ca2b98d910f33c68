pub mod p9;
pub mod payslip;
pub mod role;
