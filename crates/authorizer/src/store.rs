use ar_einv_core::models::Invoice;
use ar_einv_core::{EinvError, EinvResult};
use std::path::Path;

/// Persistence for invoice entities and their authorization fields.
pub trait InvoiceRepository: Send + Sync {
    fn get(&self, id: &str) -> EinvResult<Option<Invoice>>;
    fn put(&self, invoice: &Invoice) -> EinvResult<()>;
    /// Applies `f` to the stored invoice and persists the result.
    fn update(&self, id: &str, f: &mut dyn FnMut(&mut Invoice)) -> EinvResult<Invoice>;
    fn list(&self) -> EinvResult<Vec<Invoice>>;
}

pub struct SledInvoiceStore {
    invoices: sled::Tree,
}

fn storage(err: sled::Error) -> EinvError {
    EinvError::Storage(err.to_string())
}

impl SledInvoiceStore {
    pub fn open(path: impl AsRef<Path>) -> EinvResult<Self> {
        let db = sled::open(path).map_err(storage)?;
        Self::with_db(&db)
    }

    pub fn with_db(db: &sled::Db) -> EinvResult<Self> {
        let invoices = db.open_tree("invoices").map_err(storage)?;
        Ok(Self { invoices })
    }
}

impl InvoiceRepository for SledInvoiceStore {
    fn get(&self, id: &str) -> EinvResult<Option<Invoice>> {
        match self.invoices.get(id.as_bytes()).map_err(storage)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&self, invoice: &Invoice) -> EinvResult<()> {
        self.invoices
            .insert(invoice.id.as_bytes(), serde_json::to_vec(invoice)?)
            .map_err(storage)?;
        self.invoices.flush().map_err(storage)?;
        Ok(())
    }

    fn update(&self, id: &str, f: &mut dyn FnMut(&mut Invoice)) -> EinvResult<Invoice> {
        let mut invoice = self
            .get(id)?
            .ok_or_else(|| EinvError::Storage(format!("invoice not found: {id}")))?;
        f(&mut invoice);
        self.put(&invoice)?;
        Ok(invoice)
    }

    fn list(&self) -> EinvResult<Vec<Invoice>> {
        let mut out = Vec::new();
        for item in self.invoices.iter() {
            let (_k, v) = item.map_err(storage)?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }
}
