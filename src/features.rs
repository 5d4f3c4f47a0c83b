//! `<stream:features>` as advertised by the server after each stream open.

use crate::ns;
use crate::xml::Element;

#[derive(Debug, Clone, Default)]
pub struct StreamFeatures {
    /// Whether `<starttls/>` was advertised and whether it was `<required/>`.
    pub starttls: Option<StartTls>,
    /// SASL mechanism names, in the server's order.
    pub mechanisms: Vec<String>,
    /// Whether resource binding is offered.
    pub bind: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StartTls {
    pub required: bool,
}

impl StreamFeatures {
    pub fn from_element(element: &Element) -> Self {
        let starttls = element
            .find_child_ns("starttls", ns::TLS)
            .map(|st| StartTls {
                required: st.find_child("required").is_some(),
            });

        let mechanisms = element
            .find_child_ns("mechanisms", ns::SASL)
            .map(|mechs| {
                mechs
                    .children()
                    .filter(|child| child.name() == "mechanism")
                    .map(|child| child.content())
                    .collect()
            })
            .unwrap_or_default();

        let bind = element.find_child_ns("bind", ns::BIND).is_some();

        Self {
            starttls,
            mechanisms,
            bind,
        }
    }
}
