//! Authority code tables.
//!
//! Numeric codes as published in the electronic billing parameter tables
//! (FEParamGetTiposCbte, FEParamGetTiposDoc, FEParamGetTiposIva, ...).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoucherClass {
    A,
    B,
    C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoucherType {
    InvoiceA,
    DebitNoteA,
    CreditNoteA,
    InvoiceB,
    DebitNoteB,
    CreditNoteB,
    InvoiceC,
    DebitNoteC,
    CreditNoteC,
}

impl VoucherType {
    pub fn code(self) -> u32 {
        match self {
            VoucherType::InvoiceA => 1,
            VoucherType::DebitNoteA => 2,
            VoucherType::CreditNoteA => 3,
            VoucherType::InvoiceB => 6,
            VoucherType::DebitNoteB => 7,
            VoucherType::CreditNoteB => 8,
            VoucherType::InvoiceC => 11,
            VoucherType::DebitNoteC => 12,
            VoucherType::CreditNoteC => 13,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let voucher = match code {
            1 => VoucherType::InvoiceA,
            2 => VoucherType::DebitNoteA,
            3 => VoucherType::CreditNoteA,
            6 => VoucherType::InvoiceB,
            7 => VoucherType::DebitNoteB,
            8 => VoucherType::CreditNoteB,
            11 => VoucherType::InvoiceC,
            12 => VoucherType::DebitNoteC,
            13 => VoucherType::CreditNoteC,
            _ => return None,
        };
        Some(voucher)
    }

    pub fn class(self) -> VoucherClass {
        match self {
            VoucherType::InvoiceA | VoucherType::DebitNoteA | VoucherType::CreditNoteA => {
                VoucherClass::A
            }
            VoucherType::InvoiceB | VoucherType::DebitNoteB | VoucherType::CreditNoteB => {
                VoucherClass::B
            }
            VoucherType::InvoiceC | VoucherType::DebitNoteC | VoucherType::CreditNoteC => {
                VoucherClass::C
            }
        }
    }

    /// Credit and debit notes amend a previously authorized voucher.
    pub fn is_note(self) -> bool {
        !matches!(
            self,
            VoucherType::InvoiceA | VoucherType::InvoiceB | VoucherType::InvoiceC
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Cuit,
    Cuil,
    Cdi,
    Passport,
    Dni,
    /// Final consumer without identification; document number "0".
    Unidentified,
}

impl DocumentType {
    pub fn code(self) -> u32 {
        match self {
            DocumentType::Cuit => 80,
            DocumentType::Cuil => 86,
            DocumentType::Cdi => 87,
            DocumentType::Passport => 94,
            DocumentType::Dni => 96,
            DocumentType::Unidentified => 99,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxCondition {
    Registered,
    Exempt,
    FinalConsumer,
    Monotributo,
    NotReached,
}

impl TaxCondition {
    pub fn code(self) -> u32 {
        match self {
            TaxCondition::Registered => 1,
            TaxCondition::Exempt => 4,
            TaxCondition::FinalConsumer => 5,
            TaxCondition::Monotributo => 6,
            TaxCondition::NotReached => 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concept {
    Goods,
    Services,
    GoodsAndServices,
}

impl Concept {
    pub fn code(self) -> u32 {
        match self {
            Concept::Goods => 1,
            Concept::Services => 2,
            Concept::GoodsAndServices => 3,
        }
    }

    pub fn requires_service_period(self) -> bool {
        !matches!(self, Concept::Goods)
    }
}

/// (rate in percent, authority code)
const VAT_RATE_CODES: &[(f64, u32)] = &[
    (0.0, 3),
    (10.5, 4),
    (21.0, 5),
    (27.0, 6),
    (5.0, 8),
    (2.5, 9),
];

/// Maps a VAT rate expressed in percent to its authority code.
pub fn vat_rate_code(rate_percent: f64) -> Option<u32> {
    VAT_RATE_CODES
        .iter()
        .find(|(rate, _)| (rate - rate_percent).abs() < 1e-6)
        .map(|(_, code)| *code)
}
