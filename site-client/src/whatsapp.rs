//! Prefilled WhatsApp handoffs, opened after a form submission is safely stored.

use reqwest::Url;
use site_types::FormData;

const WHATSAPP_BASE: &str = "https://wa.me/";

/// Whatever can open a link for the user: a browser tab, an OS handler, or a log line.
pub trait Handoff: Send + Sync {
    fn open(&self, url: &str);
}

/// Logs the link instead of opening it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandoff;

impl Handoff for LogHandoff {
    fn open(&self, url: &str) {
        log::info!("WhatsApp handoff: {url}");
    }
}

/// The message a visitor sends us on WhatsApp after filling in `form`.
pub fn whatsapp_message(form: &FormData) -> String {
    let mut lines = Vec::new();
    match form {
        FormData::Contact(form) => {
            lines.push(format!("Hello! I'm {} and I'd like to get in touch.", form.name));
            if let Some(service) = &form.service {
                lines.push(format!("Service: {service}"));
            }
            lines.push(format!("Email: {}", form.email));
            if let Some(phone) = &form.phone {
                lines.push(format!("Phone: {phone}"));
            }
            lines.push(format!("Message: {}", form.message));
        }
        FormData::Career(form) => {
            lines.push(format!(
                "Hello! I'm {} and I'm applying for the {} position.",
                form.name, form.position
            ));
            if let Some(experience) = &form.experience {
                lines.push(format!("Experience: {experience}"));
            }
            lines.push(format!("Email: {}", form.email));
            lines.push(format!("Phone: {}", form.phone));
            if let Some(message) = &form.message {
                lines.push(format!("Message: {message}"));
            }
        }
        FormData::Feedback(form) => {
            lines.push(format!("Hello! {} here with some feedback.", form.name));
            if let Some(project) = &form.project {
                lines.push(format!("Project: {project}"));
            }
            if let Some(rating) = form.rating {
                lines.push(format!("Rating: {rating}/5"));
            }
            lines.push(form.feedback.clone());
        }
        FormData::ReachUs(form) => {
            lines.push(format!(
                "Hello! I'm {}, please call me back on {}.",
                form.name, form.phone
            ));
            if let Some(location) = &form.location {
                lines.push(format!("Location: {location}"));
            }
            if let Some(requirement) = &form.requirement {
                lines.push(format!("Requirement: {requirement}"));
            }
        }
    }
    lines.join("\n")
}

/// A `wa.me` deep link carrying `message`. Non-digits in `number` are dropped, as wa.me requires.
pub fn whatsapp_link(number: Option<&str>, message: &str) -> String {
    let digits: String = number
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    match Url::parse(&format!("{WHATSAPP_BASE}{digits}")) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("text", message);
            url.to_string()
        }
        Err(e) => {
            log::error!("Failed to build WhatsApp link: {e}");
            WHATSAPP_BASE.to_string()
        }
    }
}
