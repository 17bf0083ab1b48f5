//! Line selection and validation for credit and debit notes.
use std::collections::HashMap;

use rust_decimal::Decimal;

use super::LifecycleError;
use super::events::RestockLine;
use crate::document::amounts::{LineItem, PricedLine};
use crate::source::{NoteKind, NoteLines, NoteRecord};

/// Priced lines of `note`, checked against the invoice it offsets.
pub(crate) fn note_lines(
    original: &[LineItem],
    lines: &NoteLines,
) -> Result<Vec<PricedLine>, LifecycleError> {
    let priced = match lines {
        NoteLines::Full => original.iter().map(LineItem::priced).collect(),
        NoteLines::Partial(credited) => {
            let by_id: HashMap<&str, &LineItem> =
                original.iter().map(|line| (line.id.as_str(), line)).collect();
            // Entries naming the same line share its invoiced quantity.
            let mut credited_so_far: HashMap<&str, Decimal> = HashMap::new();
            credited
                .iter()
                .map(|credit| {
                    let line = by_id.get(credit.line_id.as_str()).ok_or_else(|| {
                        LifecycleError::NotFound {
                            entity: "invoice line",
                            id: credit.line_id.clone(),
                        }
                    })?;
                    if credit.quantity <= Decimal::ZERO {
                        return Err(LifecycleError::InvalidNote(format!(
                            "line {} credits a non-positive quantity",
                            credit.line_id
                        )));
                    }
                    let requested = credited_so_far
                        .entry(credit.line_id.as_str())
                        .or_insert(Decimal::ZERO);
                    *requested += credit.quantity;
                    if *requested > line.quantity {
                        return Err(LifecycleError::QuantityExceeded {
                            line_id: credit.line_id.clone(),
                            requested: *requested,
                            available: line.quantity,
                        });
                    }
                    Ok(line.priced().prorated(credit.quantity))
                })
                .collect::<Result<Vec<_>, _>>()?
        }
        NoteLines::Custom(custom) => custom.iter().map(LineItem::priced).collect(),
    };

    if priced.is_empty() {
        return Err(LifecycleError::InvalidNote("note has no lines".into()));
    }
    Ok(priced)
}

/// Goods that come back to stock once a return-type credit note is accepted.
pub(crate) fn restock_lines(note: &NoteRecord, original: &[LineItem]) -> Vec<RestockLine> {
    if note.kind != NoteKind::Credit || !note.restock {
        return Vec::new();
    }
    match &note.lines {
        NoteLines::Full => original
            .iter()
            .map(|line| RestockLine {
                line_id: line.id.clone(),
                quantity: line.quantity,
            })
            .collect(),
        NoteLines::Partial(credited) => credited
            .iter()
            .map(|credit| RestockLine {
                line_id: credit.line_id.clone(),
                quantity: credit.quantity,
            })
            .collect(),
        NoteLines::Custom(_) => Vec::new(),
    }
}
