use crate::transport::{
    action::{ActionErrorCode, InArgumentPayload},
    service_variables::IntoUpnpValue,
};

use super::action::ActionError;

/// Walks a parsed action response's arguments in the order declared by the
/// service's SCPD, handing typed values back to the caller.
///
/// Unlike a server dispatching an incoming action call, a control point already
/// knows the wire order from the SCPD it fetched, so arguments are scanned
/// positionally rather than matched by name.
#[derive(Debug, Clone)]
pub struct ArgumentScanner<'a> {
    payload: std::vec::IntoIter<InArgumentPayload<'a>>,
    expected: std::vec::IntoIter<&'a str>,
}

impl<'a> ArgumentScanner<'a> {
    pub fn new(payload: Vec<InArgumentPayload<'a>>, expected: Vec<&'a str>) -> Self {
        Self {
            payload: payload.into_iter(),
            expected: expected.into_iter(),
        }
    }

    pub fn next_unchecked<T: IntoUpnpValue>(&mut self) -> Result<T, ActionError> {
        let _expected_name = self.expected.next();
        let next = self
            .payload
            .next()
            .ok_or(ActionErrorCode::InvalidArguments)?;
        T::from_xml_value(&next.value).map_err(|_| ActionErrorCode::InvalidArguments.into())
    }
}
