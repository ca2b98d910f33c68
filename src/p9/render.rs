use chrono::Month;
use std::io::{Cursor, Write};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::model::p9::P9Certificate;
use crate::model::payslip::PayAmounts;
use crate::p9::error::{P9Error, P9Result};

/// A downloadable rendition of a certificate.
#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub content_type: &'static str,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Turns a stored certificate into a document. Rendering never writes back
/// to the certificate store.
pub trait RenderingGateway: Send + Sync {
    fn render(&self, certificate: &P9Certificate) -> P9Result<RenderedDocument>;
}

/// Tax deduction card as CSV: header, one line per month, totals line.
pub struct CsvTaxCardRenderer;

const HEADER: [&str; 11] = [
    "month",
    "basic_salary",
    "gross_pay",
    "housing_levy",
    "health_levy",
    "retirement_contribution",
    "total_deductions",
    "chargeable_pay",
    "personal_relief",
    "insurance_relief",
    "paye_tax",
];

fn record(label: &str, amounts: &PayAmounts) -> Vec<String> {
    std::iter::once(label.to_string())
        .chain(amounts.fields().iter().map(|(_, v)| v.to_string()))
        .collect()
}

impl RenderingGateway for CsvTaxCardRenderer {
    fn render(&self, certificate: &P9Certificate) -> P9Result<RenderedDocument> {
        let failed = |reason: String| P9Error::DocumentRendering {
            tax_year: certificate.tax_year,
            reason,
        };

        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());

        writer.write_record(HEADER).map_err(|e| failed(e.to_string()))?;

        for row in &certificate.monthly_breakdown {
            let label = Month::try_from(row.month)
                .map(|m| m.name().to_string())
                .map_err(|_| failed(format!("invalid month {}", row.month)))?;
            writer
                .write_record(record(&label, &row.amounts))
                .map_err(|e| failed(e.to_string()))?;
        }

        writer
            .write_record(record("TOTAL", &certificate.totals))
            .map_err(|e| failed(e.to_string()))?;

        let bytes = writer
            .into_inner()
            .map_err(|e| failed(e.to_string()))?;

        Ok(RenderedDocument {
            content_type: "text/csv",
            file_name: format!(
                "P9_{}_{}.csv",
                certificate.tax_year, certificate.employee_id
            ),
            bytes,
        })
    }
}

/// Entry listing the certificates that could not be rendered.
pub const ARCHIVE_ERRORS_ENTRY: &str = "ERRORS.txt";

/// A year's documents bundled into one ZIP.
#[derive(Debug)]
pub struct DocumentArchive {
    pub document: RenderedDocument,
    pub rendered: usize,
    pub failed: usize,
}

/// Renders every certificate into one archive. A certificate that fails to
/// render is listed in [`ARCHIVE_ERRORS_ENTRY`] instead of aborting the rest.
pub fn archive_documents(
    renderer: &dyn RenderingGateway,
    tax_year: i32,
    certificates: &[P9Certificate],
) -> P9Result<DocumentArchive> {
    let failed = |reason: String| P9Error::DocumentRendering { tax_year, reason };
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let mut errors = Vec::new();
    let mut rendered = 0;

    for certificate in certificates {
        match renderer.render(certificate) {
            Ok(document) => {
                writer.start_file(document.file_name.as_str(), options)
                    .map_err(|e| failed(e.to_string()))?;
                writer.write_all(&document.bytes)
                    .map_err(|e| failed(e.to_string()))?;
                rendered += 1;
            }
            Err(e) => {
                tracing::warn!(
                    certificate_id = certificate.id,
                    employee_id = certificate.employee_id,
                    error = %e,
                    "Left a P9 document out of the archive"
                );
                errors.push(format!(
                    "employee {} (certificate {}): {}",
                    certificate.employee_id, certificate.id, e
                ));
            }
        }
    }

    if !errors.is_empty() {
        writer.start_file(ARCHIVE_ERRORS_ENTRY, options)
            .map_err(|e| failed(e.to_string()))?;
        writer.write_all(errors.join("\n").as_bytes())
            .map_err(|e| failed(e.to_string()))?;
    }

    let bytes = writer
        .finish()
        .map_err(|e| failed(e.to_string()))?
        .into_inner();

    Ok(DocumentArchive {
        document: RenderedDocument {
            content_type: "application/zip",
            file_name: format!("P9_Reports_{tax_year}_All.zip"),
            bytes,
        },
        rendered,
        failed: errors.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p9::aggregate::{aggregate, tests::payslip};
    use crate::model::p9::NewCertificate;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn csv_has_a_line_per_month_and_a_totals_line() {
        let agg = aggregate(
            &[payslip(3, 2024, 2, dec!(52000)), payslip(3, 2024, 1, dec!(50000))],
            3,
            2024,
        )
        .unwrap();
        let certificate = NewCertificate {
            aggregate: agg,
            generated_by: None,
            generated_at: Utc.with_ymd_and_hms(2025, 1, 10, 9, 0, 0).unwrap(),
        }
        .into_certificate(11);

        let doc = CsvTaxCardRenderer.render(&certificate).unwrap();
        let text = String::from_utf8(doc.bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(doc.content_type, "text/csv");
        assert_eq!(doc.file_name, "P9_2024_3.csv");
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("month,basic_salary,gross_pay"));
        assert!(lines[1].starts_with("January,50000,50000"));
        assert!(lines[2].starts_with("February,52000"));
        assert!(lines[3].starts_with("TOTAL,102000.00,102000.00"));
    }

    fn certificate(id: u64, employee_id: u64) -> P9Certificate {
        NewCertificate {
            aggregate: aggregate(&[payslip(employee_id, 2024, 1, dec!(30000))], employee_id, 2024)
                .unwrap(),
            generated_by: None,
            generated_at: Utc.with_ymd_and_hms(2025, 1, 10, 9, 0, 0).unwrap(),
        }
        .into_certificate(id)
    }

    #[test]
    fn archive_lists_unrenderable_certificates_and_keeps_the_rest() {
        let good = certificate(1, 5);
        let mut broken = certificate(2, 6);
        broken.monthly_breakdown[0].month = 13;

        let archive = archive_documents(&CsvTaxCardRenderer, 2024, &[good, broken]).unwrap();

        assert_eq!(archive.rendered, 1);
        assert_eq!(archive.failed, 1);
        assert_eq!(archive.document.file_name, "P9_Reports_2024_All.zip");

        let mut zip = zip::ZipArchive::new(Cursor::new(archive.document.bytes)).unwrap();
        assert_eq!(zip.len(), 2);
        assert!(zip.by_name("P9_2024_5.csv").is_ok());
        let mut errors = String::new();
        std::io::Read::read_to_string(&mut zip.by_name(ARCHIVE_ERRORS_ENTRY).unwrap(), &mut errors)
            .unwrap();
        assert!(errors.contains("employee 6 (certificate 2)"));
        assert!(errors.contains("invalid month 13"));
    }
}
