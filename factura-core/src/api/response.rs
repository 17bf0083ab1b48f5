//! Field extraction from DIAN SOAP responses.
//!
//! Tags are matched by local name so the prefix the service happens to use
//! (`b:`, `s:`, none) does not matter. When a tag repeats, the first one wins.
use quick_xml::{Reader, events::Event};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("unreadable XML response: {0}")]
    Xml(#[from] quick_xml::Error),
}

/// Fields read from a `SendBillSync`, `GetStatus` or `GetStatusZip` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DianResponse {
    pub is_valid: Option<bool>,
    pub status_code: Option<String>,
    pub status_description: Option<String>,
    pub status_message: Option<String>,
    pub xml_document_key: Option<String>,
    pub zip_key: Option<String>,
    /// Entries of `ErrorMessage`, in document order.
    pub messages: Vec<String>,
    /// SOAP 1.1 `faultstring` or SOAP 1.2 `Reason/Text`.
    pub fault: Option<String>,
}

impl DianResponse {
    pub fn parse(body: &str) -> Result<DianResponse, ResponseError> {
        let mut reader = Reader::from_str(body);
        reader.config_mut().trim_text(true);

        let mut response = DianResponse::default();
        let mut path: Vec<Vec<u8>> = Vec::new();
        loop {
            match reader.read_event()? {
                Event::Start(start) => path.push(start.local_name().as_ref().to_vec()),
                Event::End(_) => {
                    path.pop();
                }
                Event::Text(text) => {
                    let value = text.unescape().map_err(quick_xml::Error::from)?;
                    let value = value.trim().to_string();
                    if !value.is_empty() {
                        response.record(&path, value);
                    }
                }
                Event::CData(data) => {
                    let value = data.decode().map_err(quick_xml::Error::from)?;
                    let value = value.trim().to_string();
                    if !value.is_empty() {
                        response.record(&path, value);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(response)
    }

    fn record(&mut self, path: &[Vec<u8>], value: String) {
        let Some(current) = path.last() else {
            return;
        };
        let parent = path.len().checked_sub(2).map(|i| path[i].as_slice());
        let slot = match current.as_slice() {
            b"IsValid" => {
                if self.is_valid.is_none() {
                    self.is_valid = value.parse::<bool>().ok();
                }
                return;
            }
            b"string" if parent == Some(b"ErrorMessage".as_slice()) => {
                self.messages.push(value);
                return;
            }
            b"StatusCode" => &mut self.status_code,
            b"StatusDescription" => &mut self.status_description,
            b"StatusMessage" => &mut self.status_message,
            b"XmlDocumentKey" => &mut self.xml_document_key,
            b"ZipKey" => &mut self.zip_key,
            b"faultstring" => &mut self.fault,
            b"Text" if parent == Some(b"Reason".as_slice()) => &mut self.fault,
            _ => return,
        };
        slot.get_or_insert(value);
    }
}
