//! Line items and monetary totals.
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Tax categories hashed into the document identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxKind {
    /// General sales tax.
    #[default]
    Iva,
    /// National consumption tax.
    Inc,
    /// Municipal industry and commerce tax.
    Ica,
}

impl TaxKind {
    pub fn code(&self) -> &'static str {
        match self {
            TaxKind::Iva => "01",
            TaxKind::Inc => "04",
            TaxKind::Ica => "03",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaxKind::Iva => "IVA",
            TaxKind::Inc => "INC",
            TaxKind::Ica => "ICA",
        }
    }
}

/// Line as supplied by the invoice data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// Percentage, e.g. `19` for 19%.
    pub tax_rate: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    #[serde(default)]
    pub tax_kind: TaxKind,
}

impl LineItem {
    pub fn priced(&self) -> PricedLine {
        let subtotal = round_amount(self.quantity * self.unit_price - self.discount);
        let tax = round_amount(subtotal * self.tax_rate / Decimal::ONE_HUNDRED);
        PricedLine {
            id: self.id.clone(),
            description: self.description.clone(),
            quantity: self.quantity,
            unit_price: self.unit_price,
            tax_kind: self.tax_kind,
            tax_rate: self.tax_rate,
            subtotal,
            tax,
            total: subtotal + tax,
        }
    }
}

/// Line with computed amounts, as it goes into a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedLine {
    pub id: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub tax_kind: TaxKind,
    pub tax_rate: Decimal,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

impl PricedLine {
    /// Same line scaled to `quantity` units of the original.
    pub fn prorated(&self, quantity: Decimal) -> PricedLine {
        if quantity == self.quantity || self.quantity.is_zero() {
            return self.clone();
        }
        let ratio = quantity / self.quantity;
        PricedLine {
            quantity,
            subtotal: round_amount(self.subtotal * ratio),
            tax: round_amount(self.tax * ratio),
            total: round_amount(self.total * ratio),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentTotals {
    pub subtotal: Decimal,
    pub iva: Decimal,
    pub inc: Decimal,
    pub ica: Decimal,
    pub total: Decimal,
}

impl DocumentTotals {
    pub fn from_lines(lines: &[PricedLine]) -> Self {
        let mut totals = DocumentTotals::default();
        for line in lines {
            totals.subtotal += line.subtotal;
            match line.tax_kind {
                TaxKind::Iva => totals.iva += line.tax,
                TaxKind::Inc => totals.inc += line.tax,
                TaxKind::Ica => totals.ica += line.tax,
            }
            totals.total += line.total;
        }
        totals
    }

    pub fn tax(&self, kind: TaxKind) -> Decimal {
        match kind {
            TaxKind::Iva => self.iva,
            TaxKind::Inc => self.inc,
            TaxKind::Ica => self.ica,
        }
    }

    pub fn tax_total(&self) -> Decimal {
        self.iva + self.inc + self.ica
    }
}

pub fn round_amount(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Two-decimal rendering used in identifiers and XML.
pub fn format_amount(value: Decimal) -> String {
    let mut rounded = round_amount(value);
    rounded.rescale(2);
    rounded.to_string()
}
