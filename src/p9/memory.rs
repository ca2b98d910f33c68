//! In-process payslip source and certificate store used by the tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::model::p9::{NewCertificate, P9Certificate, P9CertificateSummary};
use crate::model::payslip::Payslip;
use crate::p9::error::{P9Error, P9Result};
use crate::p9::source::PayslipSource;
use crate::p9::store::{CertificateFilter, CertificatePage, CertificateStore, page_offset};

#[derive(Default)]
pub struct MemoryPayslipSource {
    payslips: Mutex<Vec<Payslip>>,
    names: Mutex<HashMap<u64, String>>,
    unavailable: AtomicBool,
    names_unavailable: AtomicBool,
    pub reads: AtomicUsize,
}

impl MemoryPayslipSource {
    pub fn with(payslips: Vec<Payslip>) -> Self {
        let source = Self::default();
        *source.payslips.lock().unwrap() = payslips;
        source
    }

    pub fn push(&self, payslip: Payslip) {
        self.payslips.lock().unwrap().push(payslip);
    }

    pub fn name(&self, employee_id: u64, name: &str) {
        self.names.lock().unwrap().insert(employee_id, name.to_string());
    }

    pub fn go_down(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }

    /// Fails name lookups only; payslip reads keep working.
    pub fn names_go_down(&self) {
        self.names_unavailable.store(true, Ordering::SeqCst);
    }

    fn check(&self, tax_year: Option<i32>) -> P9Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(P9Error::from_store(sqlx::Error::PoolTimedOut, tax_year));
        }
        Ok(())
    }
}

#[async_trait]
impl PayslipSource for MemoryPayslipSource {
    async fn list_payslips(&self, employee_id: u64, tax_year: i32) -> P9Result<Vec<Payslip>> {
        self.check(Some(tax_year))?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut found: Vec<Payslip> = self
            .payslips
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.employee_id == employee_id && p.tax_year == tax_year)
            .cloned()
            .collect();
        found.sort_by_key(|p| (p.month, p.id));
        Ok(found)
    }

    async fn payslips_for_year(&self, tax_year: i32) -> P9Result<Vec<Payslip>> {
        self.check(Some(tax_year))?;
        let mut found: Vec<Payslip> = self
            .payslips
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.tax_year == tax_year)
            .cloned()
            .collect();
        found.sort_by_key(|p| (p.employee_id, p.month, p.id));
        Ok(found)
    }

    async fn employees_with_payslips(&self, tax_year: i32) -> P9Result<Vec<u64>> {
        self.check(Some(tax_year))?;
        let mut ids: Vec<u64> = self
            .payslips
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.tax_year == tax_year)
            .map(|p| p.employee_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn employee_name(&self, employee_id: u64) -> P9Result<Option<String>> {
        self.check(None)?;
        if self.names_unavailable.load(Ordering::SeqCst) {
            return Err(P9Error::from_store(sqlx::Error::PoolTimedOut, None));
        }
        Ok(self.names.lock().unwrap().get(&employee_id).cloned())
    }
}

fn summary(c: &P9Certificate) -> P9CertificateSummary {
    P9CertificateSummary {
        id: c.id,
        employee_id: c.employee_id,
        tax_year: c.tax_year,
        payslip_count: c.payslip_count,
        totals: c.totals,
        generated_by: c.generated_by,
        generated_at: c.generated_at,
    }
}

/// Keeps certificates in a map keyed by (employee, year). `insert` yields to
/// the executor before taking the key so concurrent callers interleave the
/// way they do against a real database.
#[derive(Default)]
pub struct MemoryCertificateStore {
    certificates: Mutex<HashMap<(u64, i32), P9Certificate>>,
    next_id: AtomicU64,
    pub inserts: AtomicUsize,
}

impl MemoryCertificateStore {
    pub fn count(&self) -> usize {
        self.certificates.lock().unwrap().len()
    }

    /// Stores a certificate directly, bypassing create-or-fetch.
    pub fn put(&self, new: NewCertificate) -> P9Certificate {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let certificate = new.into_certificate(id);
        self.certificates.lock().unwrap().insert(
            (certificate.employee_id, certificate.tax_year),
            certificate.clone(),
        );
        certificate
    }
}

#[async_trait]
impl CertificateStore for MemoryCertificateStore {
    async fn find(&self, employee_id: u64, tax_year: i32) -> P9Result<Option<P9Certificate>> {
        Ok(self
            .certificates
            .lock()
            .unwrap()
            .get(&(employee_id, tax_year))
            .cloned())
    }

    async fn find_by_id(&self, id: u64) -> P9Result<Option<P9Certificate>> {
        Ok(self
            .certificates
            .lock()
            .unwrap()
            .values()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn list(&self, filter: &CertificateFilter) -> P9Result<CertificatePage> {
        let page = filter.page.max(1);
        let per_page = filter.per_page.clamp(1, 100);

        let mut matching: Vec<_> = self
            .certificates
            .lock()
            .unwrap()
            .values()
            .filter(|c| filter.employee_id.is_none_or(|e| c.employee_id == e))
            .filter(|c| filter.tax_year.is_none_or(|y| c.tax_year == y))
            .map(summary)
            .collect();
        matching.sort_by(|a, b| {
            b.tax_year
                .cmp(&a.tax_year)
                .then(a.employee_id.cmp(&b.employee_id))
        });

        let total = matching.len() as i64;
        let data = matching
            .into_iter()
            .skip(usize::try_from(page_offset(page, per_page)).unwrap_or(usize::MAX))
            .take(per_page as usize)
            .collect();

        Ok(CertificatePage {
            data,
            page,
            per_page,
            total,
        })
    }

    async fn for_year(&self, tax_year: i32) -> P9Result<Vec<P9Certificate>> {
        let mut found: Vec<P9Certificate> = self
            .certificates
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.tax_year == tax_year)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.employee_id);
        Ok(found)
    }

    async fn insert(&self, new: &NewCertificate) -> P9Result<Option<P9Certificate>> {
        actix_web::rt::task::yield_now().await;

        let key = (new.aggregate.employee_id, new.aggregate.tax_year);
        let mut certificates = self.certificates.lock().unwrap();
        if certificates.contains_key(&key) {
            return Ok(None);
        }

        self.inserts.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let certificate = new.clone().into_certificate(id);
        certificates.insert(key, certificate.clone());
        Ok(Some(certificate))
    }

    async fn replace(&self, new: &NewCertificate) -> P9Result<P9Certificate> {
        let key = (new.aggregate.employee_id, new.aggregate.tax_year);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let certificate = new.clone().into_certificate(id);
        self.certificates
            .lock()
            .unwrap()
            .insert(key, certificate.clone());
        Ok(certificate)
    }
}
