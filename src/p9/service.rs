//! Generation and retrieval of P9 certificates.

use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use utoipa::ToSchema;

use crate::model::p9::{Aggregate, NewCertificate, P9Certificate, TAX_YEARS};
use crate::model::payslip::{PayAmounts, Payslip};
use crate::p9::aggregate::{aggregate, round_money};
use crate::p9::error::{P9Error, P9Result};
use crate::p9::render::{DocumentArchive, RenderedDocument, RenderingGateway, archive_documents};
use crate::p9::source::PayslipSource;
use crate::p9::store::{CertificateFilter, CertificatePage, CertificateStore, CreateOutcome};
use crate::utils::clock::Clock;

/// Attempts at creating a certificate whose key keeps conflicting without
/// a winner becoming visible.
const MAX_CONFLICT_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GenerationOutcome {
    Generated,
    AlreadyOnFile,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub certificate: P9Certificate,
    pub outcome: GenerationOutcome,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PayslipSummary {
    pub employee_id: u64,
    pub tax_year: i32,
    pub payslip_count: usize,
    /// Distinct months with a payslip, ascending
    pub months: Vec<u8>,
    pub total_gross_pay: Decimal,
    pub total_paye_tax: Decimal,
    pub total_retirement_contribution: Decimal,
    /// A payslip for every month of the year
    pub complete_year: bool,
    pub certificate_on_file: bool,
}

impl PayslipSummary {
    fn of(employee_id: u64, tax_year: i32, payslips: &[&Payslip], certificate_on_file: bool) -> Self {
        let months: BTreeSet<u8> = payslips.iter().map(|p| p.month).collect();
        let sum = |f: fn(&PayAmounts) -> Decimal| round_money(payslips.iter().map(|p| f(&p.amounts)).sum());

        PayslipSummary {
            employee_id,
            tax_year,
            payslip_count: payslips.len(),
            complete_year: months.len() == 12,
            months: months.into_iter().collect(),
            total_gross_pay: sum(|a| a.gross_pay),
            total_paye_tax: sum(|a| a.paye_tax),
            total_retirement_contribution: sum(|a| a.retirement_contribution),
            certificate_on_file,
        }
    }
}

/// Payslip coverage of a whole tax year, one entry per employee.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct YearPayslipSummary {
    pub tax_year: i32,
    pub employee_count: usize,
    pub payslip_count: usize,
    /// Employees with a payslip for all twelve months
    pub complete_year_count: usize,
    pub certificates_on_file: usize,
    pub total_gross_pay: Decimal,
    pub total_paye_tax: Decimal,
    /// Ascending by employee
    pub employees: Vec<PayslipSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BulkItemStatus {
    Generated,
    AlreadyOnFile,
    Failed,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BulkItem {
    pub employee_id: u64,
    pub status: BulkItemStatus,
    pub certificate_id: Option<u64>,
    /// Error kind, for failed items
    pub error: Option<String>,
    pub reason: Option<String>,
}

impl BulkItem {
    fn from_result(employee_id: u64, result: P9Result<Generation>) -> Self {
        match result {
            Ok(g) => BulkItem {
                employee_id,
                status: match g.outcome {
                    GenerationOutcome::Generated => BulkItemStatus::Generated,
                    GenerationOutcome::AlreadyOnFile => BulkItemStatus::AlreadyOnFile,
                },
                certificate_id: Some(g.certificate.id),
                error: None,
                reason: None,
            },
            Err(e) => BulkItem {
                employee_id,
                status: BulkItemStatus::Failed,
                certificate_id: None,
                error: Some(e.kind().to_string()),
                reason: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BulkReport {
    pub batch_id: String,
    pub tax_year: i32,
    pub total_employees: usize,
    pub generated: usize,
    pub already_on_file: usize,
    pub failed: usize,
    pub results: Vec<BulkItem>,
}

/// Orchestrates the payslip source, the aggregation engine, the certificate
/// store and the renderer.
pub struct GenerationService {
    payslips: Arc<dyn PayslipSource>,
    certificates: Arc<dyn CertificateStore>,
    renderer: Arc<dyn RenderingGateway>,
    clock: Arc<dyn Clock>,
    bulk_concurrency: usize,
}

impl GenerationService {
    pub fn new(
        payslips: Arc<dyn PayslipSource>,
        certificates: Arc<dyn CertificateStore>,
        renderer: Arc<dyn RenderingGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            payslips,
            certificates,
            renderer,
            clock,
            bulk_concurrency: 4,
        }
    }

    pub fn with_bulk_concurrency(mut self, bulk_concurrency: usize) -> Self {
        self.bulk_concurrency = bulk_concurrency.max(1);
        self
    }

    pub fn current_year(&self) -> i32 {
        self.clock.current_year()
    }

    fn check_year(tax_year: i32) -> P9Result<()> {
        if TAX_YEARS.contains(&tax_year) {
            Ok(())
        } else {
            Err(P9Error::InvalidTaxYear(tax_year))
        }
    }

    /// The aggregation path shared by generation and auto-populate. Nothing
    /// is persisted.
    pub async fn preview(&self, employee_id: u64, tax_year: i32) -> P9Result<Aggregate> {
        Self::check_year(tax_year)?;
        let payslips = self.payslips.list_payslips(employee_id, tax_year).await?;
        aggregate(&payslips, employee_id, tax_year)
    }

    /// Returns the certificate on file for (employee, year), creating it from
    /// payslips when there is none. Concurrent callers all get the single
    /// certificate that won the store's unique key.
    #[instrument(name = "p9_generate", skip(self))]
    pub async fn generate_or_fetch(
        &self,
        employee_id: u64,
        tax_year: i32,
        requested_by: Option<u64>,
    ) -> P9Result<Generation> {
        let result = self.try_generate(employee_id, tax_year, requested_by).await;
        if let Err(e) = &result {
            e.log(employee_id);
        }
        result
    }

    async fn try_generate(
        &self,
        employee_id: u64,
        tax_year: i32,
        requested_by: Option<u64>,
    ) -> P9Result<Generation> {
        Self::check_year(tax_year)?;

        if let Some(existing) = self.certificates.find(employee_id, tax_year).await? {
            info!(certificate_id = existing.id, "P9 certificate already on file");
            return Ok(Generation {
                certificate: existing,
                outcome: GenerationOutcome::AlreadyOnFile,
            });
        }

        let new = NewCertificate {
            aggregate: self.preview(employee_id, tax_year).await?,
            generated_by: requested_by,
            generated_at: self.clock.now(),
        };

        for attempt in 1..=MAX_CONFLICT_RETRIES {
            match self.certificates.get_or_create(&new).await? {
                CreateOutcome::Created(certificate) => {
                    info!(
                        certificate_id = certificate.id,
                        months = certificate.monthly_breakdown.len(),
                        "P9 certificate generated"
                    );
                    return Ok(Generation {
                        certificate,
                        outcome: GenerationOutcome::Generated,
                    });
                }
                CreateOutcome::AlreadyExisted(certificate) => {
                    info!(certificate_id = certificate.id, "P9 certificate already on file");
                    return Ok(Generation {
                        certificate,
                        outcome: GenerationOutcome::AlreadyOnFile,
                    });
                }
                CreateOutcome::Conflict => {
                    debug!(attempt, "Lost the create race, fetching the winner");
                    if let Some(winner) = self.certificates.find(employee_id, tax_year).await? {
                        info!(certificate_id = winner.id, "Returning concurrently generated P9 certificate");
                        return Ok(Generation {
                            certificate: winner,
                            outcome: GenerationOutcome::AlreadyOnFile,
                        });
                    }
                }
            }
        }

        Err(P9Error::StoreUnavailable {
            tax_year: Some(tax_year),
            reason: "the certificate key stayed contended without a visible winner".into(),
        })
    }

    /// Replaces the certificate for (employee, year) with one built from the
    /// current payslips.
    #[instrument(name = "p9_regenerate", skip(self))]
    pub async fn regenerate(
        &self,
        employee_id: u64,
        tax_year: i32,
        requested_by: Option<u64>,
    ) -> P9Result<P9Certificate> {
        let result = async {
            let new = NewCertificate {
                aggregate: self.preview(employee_id, tax_year).await?,
                generated_by: requested_by,
                generated_at: self.clock.now(),
            };
            self.certificates.regenerate(&new).await
        }
        .await;

        match &result {
            Ok(certificate) => info!(certificate_id = certificate.id, "P9 certificate regenerated"),
            Err(e) => e.log(employee_id),
        }
        result
    }

    /// Generates certificates for `employee_ids`, or for every employee with
    /// payslips in the year. One employee's failure never stops the batch.
    #[instrument(name = "p9_bulk_generate", skip(self, employee_ids), fields(batch_id = tracing::field::Empty))]
    pub async fn bulk_generate(
        &self,
        tax_year: i32,
        employee_ids: Option<Vec<u64>>,
        requested_by: Option<u64>,
    ) -> P9Result<BulkReport> {
        Self::check_year(tax_year)?;

        let batch_id = uuid::Uuid::new_v4().to_string();
        tracing::Span::current().record("batch_id", batch_id.as_str());

        let mut ids = match employee_ids {
            Some(ids) => ids,
            None => self.payslips.employees_with_payslips(tax_year).await?,
        };
        ids.sort_unstable();
        ids.dedup();

        info!(tax_year, employees = ids.len(), "Bulk P9 generation started");

        let mut results: Vec<BulkItem> = stream::iter(ids.iter().copied())
            .map(|employee_id| async move {
                let result = self.generate_or_fetch(employee_id, tax_year, requested_by).await;
                BulkItem::from_result(employee_id, result)
            })
            .buffer_unordered(self.bulk_concurrency)
            .collect()
            .await;
        results.sort_by_key(|item| item.employee_id);

        let count = |status: BulkItemStatus| results.iter().filter(|item| item.status == status).count();
        let report = BulkReport {
            generated: count(BulkItemStatus::Generated),
            already_on_file: count(BulkItemStatus::AlreadyOnFile),
            failed: count(BulkItemStatus::Failed),
            batch_id,
            tax_year,
            total_employees: ids.len(),
            results,
        };

        info!(
            generated = report.generated,
            already_on_file = report.already_on_file,
            failed = report.failed,
            "Bulk P9 generation finished"
        );

        Ok(report)
    }

    /// Counts and headline totals of the payslips available for a year,
    /// without validating them.
    pub async fn payslip_summary(&self, employee_id: u64, tax_year: i32) -> P9Result<PayslipSummary> {
        Self::check_year(tax_year)?;
        let payslips = self.payslips.list_payslips(employee_id, tax_year).await?;
        let certificate_on_file = self.certificates.find(employee_id, tax_year).await?.is_some();

        let payslips: Vec<&Payslip> = payslips.iter().collect();
        Ok(PayslipSummary::of(employee_id, tax_year, &payslips, certificate_on_file))
    }

    /// [`payslip_summary`](Self::payslip_summary) for every employee with
    /// payslips in the year, plus year-wide counts.
    #[instrument(name = "p9_year_summary", skip(self))]
    pub async fn year_summary(&self, tax_year: i32) -> P9Result<YearPayslipSummary> {
        Self::check_year(tax_year)?;
        let payslips = self.payslips.payslips_for_year(tax_year).await?;
        let on_file: HashSet<u64> = self
            .certificates
            .for_year(tax_year)
            .await?
            .iter()
            .map(|c| c.employee_id)
            .collect();

        let mut by_employee: BTreeMap<u64, Vec<&Payslip>> = BTreeMap::new();
        for payslip in &payslips {
            by_employee.entry(payslip.employee_id).or_default().push(payslip);
        }

        let employees: Vec<PayslipSummary> = by_employee
            .iter()
            .map(|(&employee_id, slips)| {
                PayslipSummary::of(employee_id, tax_year, slips, on_file.contains(&employee_id))
            })
            .collect();

        let summary = YearPayslipSummary {
            tax_year,
            employee_count: employees.len(),
            payslip_count: payslips.len(),
            complete_year_count: employees.iter().filter(|e| e.complete_year).count(),
            certificates_on_file: employees.iter().filter(|e| e.certificate_on_file).count(),
            total_gross_pay: round_money(employees.iter().map(|e| e.total_gross_pay).sum()),
            total_paye_tax: round_money(employees.iter().map(|e| e.total_paye_tax).sum()),
            employees,
        };
        debug!(employees = summary.employee_count, "Summarised payslips for the year");
        Ok(summary)
    }

    pub async fn get(&self, id: u64) -> P9Result<P9Certificate> {
        self.certificates
            .find_by_id(id)
            .await?
            .ok_or(P9Error::NotFound)
    }

    pub async fn list(&self, filter: &CertificateFilter) -> P9Result<CertificatePage> {
        self.certificates.list(filter).await
    }

    /// Display name from the HR records. `None` when the employee, or the
    /// HR schema itself, is absent.
    pub async fn employee_name(&self, employee_id: u64) -> P9Result<Option<String>> {
        self.payslips.employee_name(employee_id).await
    }

    /// Renders a certificate the caller already holds.
    pub fn render_certificate(&self, certificate: &P9Certificate) -> P9Result<RenderedDocument> {
        self.renderer
            .render(certificate)
            .inspect_err(|e| e.log(certificate.employee_id))
    }

    /// Every stored certificate of `tax_year` rendered into one ZIP.
    #[instrument(name = "p9_archive", skip(self))]
    pub async fn documents_archive(&self, tax_year: i32) -> P9Result<DocumentArchive> {
        Self::check_year(tax_year)?;
        let certificates = self.certificates.for_year(tax_year).await?;
        if certificates.is_empty() {
            return Err(P9Error::NotFound);
        }

        let archive = archive_documents(self.renderer.as_ref(), tax_year, &certificates)?;
        info!(
            rendered = archive.rendered,
            failed = archive.failed,
            "P9 document archive built"
        );
        Ok(archive)
    }
}
