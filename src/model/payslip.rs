use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use utoipa::ToSchema;

/// The statutory money columns carried by a payslip, a monthly breakdown row
/// and a certificate total alike.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct PayAmounts {
    #[schema(example = "50000.00")]
    pub basic_salary: Decimal,

    #[schema(example = "50000.00")]
    pub gross_pay: Decimal,

    /// Affordable housing levy
    #[schema(example = "750.00")]
    pub housing_levy: Decimal,

    /// Social health insurance levy
    #[schema(example = "1375.00")]
    pub health_levy: Decimal,

    #[schema(example = "2160.00")]
    pub retirement_contribution: Decimal,

    #[schema(example = "4285.00")]
    pub total_deductions: Decimal,

    #[schema(example = "45715.00")]
    pub chargeable_pay: Decimal,

    #[schema(example = "2400.00")]
    pub personal_relief: Decimal,

    #[schema(example = "0.00")]
    pub insurance_relief: Decimal,

    #[schema(example = "7806.25")]
    pub paye_tax: Decimal,
}

impl PayAmounts {
    /// Field name and value pairs, in column order.
    pub fn fields(&self) -> [(&'static str, Decimal); 10] {
        [
            ("basic_salary", self.basic_salary),
            ("gross_pay", self.gross_pay),
            ("housing_levy", self.housing_levy),
            ("health_levy", self.health_levy),
            ("retirement_contribution", self.retirement_contribution),
            ("total_deductions", self.total_deductions),
            ("chargeable_pay", self.chargeable_pay),
            ("personal_relief", self.personal_relief),
            ("insurance_relief", self.insurance_relief),
            ("paye_tax", self.paye_tax),
        ]
    }

    /// Applies `f` to every field.
    pub fn map(self, f: impl Fn(Decimal) -> Decimal) -> Self {
        Self {
            basic_salary: f(self.basic_salary),
            gross_pay: f(self.gross_pay),
            housing_levy: f(self.housing_levy),
            health_levy: f(self.health_levy),
            retirement_contribution: f(self.retirement_contribution),
            total_deductions: f(self.total_deductions),
            chargeable_pay: f(self.chargeable_pay),
            personal_relief: f(self.personal_relief),
            insurance_relief: f(self.insurance_relief),
            paye_tax: f(self.paye_tax),
        }
    }
}

impl AddAssign for PayAmounts {
    fn add_assign(&mut self, rhs: Self) {
        self.basic_salary += rhs.basic_salary;
        self.gross_pay += rhs.gross_pay;
        self.housing_levy += rhs.housing_levy;
        self.health_levy += rhs.health_levy;
        self.retirement_contribution += rhs.retirement_contribution;
        self.total_deductions += rhs.total_deductions;
        self.chargeable_pay += rhs.chargeable_pay;
        self.personal_relief += rhs.personal_relief;
        self.insurance_relief += rhs.insurance_relief;
        self.paye_tax += rhs.paye_tax;
    }
}

/// One issued payslip. Written by the payroll subsystem, read-only here.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payslip {
    pub id: u64,
    pub employee_id: u64,
    pub tax_year: i32,
    /// Calendar month, 1..=12
    pub month: u8,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub amounts: PayAmounts,
}
