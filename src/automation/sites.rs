//! Per-site portal implementations and the site registry.
//!
//! Each supported site gets a selector table (`SiteSpec`) and shares one
//! generic `WebPortal` driving a real browser context. Form fields are
//! classified from their attributes into logical kinds and filled from
//! the profile.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use crate::automation::browser::Browser;
use crate::automation::portal::{FillReport, FormSnapshot, PortalFactory, SitePortal};
use crate::config::UserProfile;
use crate::error::StepError;

/// Logical kind of data a form field expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    FirstName,
    LastName,
    FullName,
    Email,
    Phone,
    Location,
    Resume,
    CoverLetter,
    Experience,
    Salary,
    Availability,
    LinkedIn,
    Website,
    Message,
    Unknown,
}

impl FieldKind {
    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::FirstName => "first_name",
            FieldKind::LastName => "last_name",
            FieldKind::FullName => "full_name",
            FieldKind::Email => "email",
            FieldKind::Phone => "phone",
            FieldKind::Location => "location",
            FieldKind::Resume => "resume",
            FieldKind::CoverLetter => "cover_letter",
            FieldKind::Experience => "experience",
            FieldKind::Salary => "salary",
            FieldKind::Availability => "availability",
            FieldKind::LinkedIn => "linkedin",
            FieldKind::Website => "website",
            FieldKind::Message => "message",
            FieldKind::Unknown => "unknown",
        }
    }
}

/// Keyword tables checked in order; first hit wins.
const FIELD_KEYWORDS: &[(FieldKind, &[&str])] = &[
    (FieldKind::FirstName, &["firstname", "fname", "first-name", "given-name"]),
    (FieldKind::LastName, &["lastname", "lname", "last-name", "family-name"]),
    (FieldKind::Email, &["email", "e-mail"]),
    (FieldKind::Phone, &["phone", "telephone", "mobile", "tel"]),
    (FieldKind::Resume, &["resume", "cv"]),
    (FieldKind::CoverLetter, &["cover", "letter"]),
    (FieldKind::Experience, &["experience", "years", "yoe"]),
    (FieldKind::Salary, &["salary", "compensation", "expected", "rate"]),
    (FieldKind::Availability, &["availability", "notice"]),
    (FieldKind::LinkedIn, &["linkedin"]),
    (FieldKind::Website, &["website", "portfolio"]),
    (FieldKind::Location, &["location", "address", "city"]),
    (FieldKind::FullName, &["fullname", "full-name", "name"]),
    (FieldKind::Message, &["message", "additional", "comments", "why"]),
];

const FUZZY_THRESHOLD: f64 = 0.92;

/// Raw attributes of one form control.
#[derive(Debug, Clone, Default)]
pub struct FieldDescriptor {
    pub tag: String,
    pub input_type: String,
    pub name: String,
    pub id: String,
    pub placeholder: String,
    pub aria_label: String,
    pub required: bool,
}

pub fn classify_field(field: &FieldDescriptor) -> FieldKind {
    let haystack = format!(
        "{} {} {} {}",
        field.name, field.id, field.placeholder, field.aria_label
    )
    .to_lowercase();

    for (kind, keywords) in FIELD_KEYWORDS {
        if keywords.iter().any(|k| haystack.contains(k)) {
            return *kind;
        }
    }

    // Tolerate near-miss attribute spellings.
    let tokens: Vec<&str> = haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() > 2)
        .collect();
    for (kind, keywords) in FIELD_KEYWORDS {
        for keyword in *keywords {
            if tokens
                .iter()
                .any(|t| strsim::jaro_winkler(t, keyword) >= FUZZY_THRESHOLD)
            {
                return *kind;
            }
        }
    }

    match field.input_type.as_str() {
        "email" => FieldKind::Email,
        "tel" => FieldKind::Phone,
        "file" => FieldKind::Resume,
        _ if field.tag == "textarea" => FieldKind::Message,
        _ => FieldKind::Unknown,
    }
}

/// Value the profile supplies for a field kind, when it has one.
pub fn value_for(kind: FieldKind, profile: &UserProfile) -> Option<String> {
    let non_empty = |s: &str| {
        if s.trim().is_empty() {
            None
        } else {
            Some(s.trim().to_string())
        }
    };

    match kind {
        FieldKind::FirstName => non_empty(&profile.first_name),
        FieldKind::LastName => non_empty(&profile.last_name),
        FieldKind::FullName => {
            non_empty(&format!("{} {}", profile.first_name, profile.last_name))
        }
        FieldKind::Email => non_empty(&profile.email),
        FieldKind::Phone => profile.phone.clone(),
        FieldKind::Location => profile.location.clone(),
        FieldKind::Experience => Some(profile.experience_years.to_string()),
        FieldKind::LinkedIn => {
            if profile.first_name.is_empty() || profile.last_name.is_empty() {
                None
            } else {
                Some(format!(
                    "linkedin.com/in/{}-{}",
                    profile.first_name.to_lowercase(),
                    profile.last_name.to_lowercase()
                ))
            }
        }
        FieldKind::Message | FieldKind::CoverLetter => Some(format!(
            "I am interested in this position and believe my {} years of experience would be valuable.",
            profile.experience_years
        )),
        // File inputs go through the upload step; the rest have no
        // sensible automatic answer.
        FieldKind::Resume
        | FieldKind::Salary
        | FieldKind::Availability
        | FieldKind::Website
        | FieldKind::Unknown => None,
    }
}

/// Selector table for one supported job site.
pub struct SiteSpec {
    pub site: &'static str,
    pub apply_button: &'static [&'static str],
    pub form_container: &'static [&'static str],
    /// Fallback detection strategy for the one permitted re-try.
    pub form_container_alternate: &'static [&'static str],
    pub submit_button: &'static [&'static str],
    pub confirmation_selectors: &'static [&'static str],
    pub confirmation_text: &'static [&'static str],
    pub challenge_selectors: &'static [&'static str],
    pub upload_input: &'static [&'static str],
    /// Logical fields this site always requires on its form.
    pub required_fields: &'static [FieldKind],
}

static LINKEDIN: SiteSpec = SiteSpec {
    site: "linkedin",
    apply_button: &[".jobs-apply-button", "[aria-label*='Easy Apply']"],
    form_container: &[".jobs-easy-apply-content", "form.jobs-easy-apply-form"],
    form_container_alternate: &["div[data-test-modal] form", "form"],
    submit_button: &["[aria-label*='Submit application']", "button[aria-label*='Submit']"],
    confirmation_selectors: &[".jobs-post-apply__content", ".artdeco-inline-feedback--success"],
    confirmation_text: &["application sent", "your application was sent"],
    challenge_selectors: &["#username", ".login__form"],
    upload_input: &["input[type='file']"],
    required_fields: &[FieldKind::Email, FieldKind::Phone],
};

static INDEED: SiteSpec = SiteSpec {
    site: "indeed",
    apply_button: &["#indeedApplyButton", "[aria-label*='Apply now']"],
    form_container: &[".ia-ApplyFormScreen", "#ia-container"],
    form_container_alternate: &["form"],
    submit_button: &["button[aria-label*='Continue']", ".ia-continueButton", "button[type='submit']"],
    confirmation_selectors: &[".ia-ApplyConfirmation"],
    confirmation_text: &["application submitted", "you've applied", "application complete"],
    challenge_selectors: &["#ifl-InputFormField-3"],
    upload_input: &["input[type='file']"],
    required_fields: &[FieldKind::FullName, FieldKind::Email],
};

static DICE: SiteSpec = SiteSpec {
    site: "dice",
    apply_button: &["[data-cy='apply-button-link']", "#applyButton"],
    form_container: &["[data-cy='application-form']", "form.application"],
    form_container_alternate: &["form"],
    submit_button: &["button[type='submit']"],
    confirmation_selectors: &["[data-cy='application-submitted']"],
    confirmation_text: &["application submitted", "successfully applied"],
    challenge_selectors: &["form[action*='login']"],
    upload_input: &["input[type='file']"],
    required_fields: &[FieldKind::Email],
};

/// Markers shared by every site.
const ALREADY_APPLIED_MARKERS: &[&str] = &[
    "already applied",
    "application sent",
    "application submitted",
    "view application",
    "applied on",
];

const CAPTCHA_SELECTORS: &[&str] = &[
    "iframe[src*='captcha']",
    ".g-recaptcha",
    "#captcha",
    "input[name='captcha']",
];

const CHALLENGE_TEXT_MARKERS: &[&str] = &[
    "verify you are human",
    "security check",
    "unusual activity",
];

pub fn spec_for(site: &str) -> Option<&'static SiteSpec> {
    match site {
        "linkedin" => Some(&LINKEDIN),
        "indeed" => Some(&INDEED),
        "dice" => Some(&DICE),
        _ => None,
    }
}

pub fn supported_sites() -> &'static [&'static str] {
    &["linkedin", "indeed", "dice"]
}

/// Generic portal driving one browser context against one site spec.
pub struct WebPortal {
    browser: Browser,
    spec: &'static SiteSpec,
    snapshot: FormSnapshot,
}

impl WebPortal {
    pub fn new(browser: Browser, spec: &'static SiteSpec) -> Self {
        Self {
            browser,
            spec,
            snapshot: FormSnapshot::default(),
        }
    }

    async fn describe(&self, element: &thirtyfour::WebElement) -> FieldDescriptor {
        let attr = |v: Result<Option<String>, _>| v.ok().flatten().unwrap_or_default();
        FieldDescriptor {
            tag: element.tag_name().await.unwrap_or_default().to_lowercase(),
            input_type: attr(element.attr("type").await),
            name: attr(element.attr("name").await),
            id: attr(element.attr("id").await),
            placeholder: attr(element.attr("placeholder").await),
            aria_label: attr(element.attr("aria-label").await),
            required: element.attr("required").await.ok().flatten().is_some(),
        }
    }

    async fn scan_fields(&self) -> Result<(FormSnapshot, Vec<FieldKind>), StepError> {
        let elements = self.browser.find_all("input, textarea, select").await?;
        let mut kinds = Vec::new();
        let mut required = Vec::new();
        let mut has_upload = false;

        for element in &elements {
            let descriptor = self.describe(element).await;
            if matches!(descriptor.input_type.as_str(), "hidden" | "submit" | "button") {
                continue;
            }
            if descriptor.input_type == "file" {
                has_upload = true;
                if descriptor.required {
                    required.push(FieldKind::Resume.label().to_string());
                }
                continue;
            }
            let kind = classify_field(&descriptor);
            if descriptor.required && kind != FieldKind::Unknown {
                required.push(kind.label().to_string());
            }
            kinds.push(kind);
        }

        Ok((
            FormSnapshot {
                required_fields: required,
                has_upload,
            },
            kinds,
        ))
    }
}

#[async_trait]
impl SitePortal for WebPortal {
    fn site(&self) -> &str {
        self.spec.site
    }

    async fn navigate(&mut self, url: &str) -> Result<(), StepError> {
        self.browser.goto(url).await
    }

    async fn already_applied(&mut self) -> Result<bool, StepError> {
        let text = self.browser.page_text().await.unwrap_or_default().to_lowercase();
        Ok(ALREADY_APPLIED_MARKERS.iter().any(|m| text.contains(m)))
    }

    async fn challenge_present(&mut self) -> Result<bool, StepError> {
        if self.browser.any_present(CAPTCHA_SELECTORS).await
            || self.browser.any_present(self.spec.challenge_selectors).await
        {
            return Ok(true);
        }
        let text = self.browser.page_text().await.unwrap_or_default().to_lowercase();
        Ok(CHALLENGE_TEXT_MARKERS.iter().any(|m| text.contains(m)))
    }

    async fn detect_form(&mut self, alternate: bool) -> Result<FormSnapshot, StepError> {
        // The form often sits behind the apply button; skip the click
        // when a container is already on screen.
        if !self.browser.any_present(self.spec.form_container).await {
            self.browser.click_any(self.spec.apply_button).await?;
        }

        let containers = if alternate {
            self.spec.form_container_alternate
        } else {
            self.spec.form_container
        };
        self.browser.wait_for_any(containers).await?;

        let (snapshot, kinds) = self.scan_fields().await?;
        for kind in self.spec.required_fields {
            if !kinds.contains(kind) {
                return Err(StepError::ElementNotFound(format!(
                    "required field '{}' not exposed by form",
                    kind.label()
                )));
            }
        }

        debug!(site = self.spec.site, fields = kinds.len(), upload = snapshot.has_upload, "form detected");
        self.snapshot = snapshot.clone();
        Ok(snapshot)
    }

    async fn fill_form(
        &mut self,
        profile: &UserProfile,
        resume_path: &str,
    ) -> Result<FillReport, StepError> {
        let elements = self.browser.find_all("input, textarea, select").await?;
        let mut report = FillReport::default();

        for element in &elements {
            let descriptor = self.describe(element).await;
            if matches!(
                descriptor.input_type.as_str(),
                "hidden" | "submit" | "button" | "file" | "checkbox" | "radio"
            ) {
                continue;
            }

            let kind = classify_field(&descriptor);
            let Some(value) = value_for(kind, profile) else {
                continue;
            };

            if descriptor.tag == "select" {
                // Best effort: pick the option whose text matches.
                if let Ok(options) = element.find_all(thirtyfour::By::Tag("option")).await {
                    for option in options {
                        let text = option.text().await.unwrap_or_default().to_lowercase();
                        if text.contains(&value.to_lowercase()) {
                            let _ = option.click().await;
                            report.filled.push(kind.label().to_string());
                            break;
                        }
                    }
                }
            } else {
                self.browser.fill(element, &value).await?;
                report.filled.push(kind.label().to_string());
            }
        }

        for required in &self.snapshot.required_fields {
            if required == FieldKind::Resume.label() {
                if resume_path.trim().is_empty() {
                    report.missing_required.push(required.clone());
                }
            } else if !report.filled.iter().any(|f| f == required) {
                report.missing_required.push(required.clone());
            }
        }

        Ok(report)
    }

    async fn upload_resume(&mut self, resume_path: &str) -> Result<(), StepError> {
        let input = self.browser.wait_for_any(self.spec.upload_input).await?;
        input
            .send_keys(resume_path)
            .await
            .map_err(|e| StepError::Network(e.to_string()))
    }

    async fn submit(&mut self) -> Result<(), StepError> {
        info!(site = self.spec.site, "submitting application");
        self.browser.click_any(self.spec.submit_button).await
    }

    async fn verify_submission(&mut self) -> Result<Option<String>, StepError> {
        if self.browser.any_present(self.spec.confirmation_selectors).await {
            let url = self.browser.current_url().await?;
            return Ok(Some(url));
        }

        let text = self.browser.page_text().await.unwrap_or_default().to_lowercase();
        if self.spec.confirmation_text.iter().any(|m| text.contains(m)) {
            let url = self.browser.current_url().await?;
            return Ok(Some(url));
        }

        Ok(None)
    }

    async fn screenshot(&mut self, label: &str) -> Option<String> {
        self.browser.screenshot(label).await.ok()
    }

    async fn close(&mut self) {
        self.browser.quit().await;
    }
}

/// Opens a fresh browser context per attempt, keyed on the posting's
/// site.
pub struct WebPortalFactory {
    pub webdriver_url: String,
    pub headless: bool,
    pub timeout: Duration,
    pub screenshot_dir: String,
}

#[async_trait]
impl PortalFactory for WebPortalFactory {
    async fn open(&self, site: &str) -> Result<Box<dyn SitePortal>, StepError> {
        let spec = spec_for(site).ok_or_else(|| StepError::UnsupportedSite(site.to_string()))?;
        let browser = Browser::connect(
            &self.webdriver_url,
            self.headless,
            self.timeout,
            &self.screenshot_dir,
        )
        .await?;
        Ok(Box::new(WebPortal::new(browser, spec)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, input_type: &str, tag: &str) -> FieldDescriptor {
        FieldDescriptor {
            tag: tag.to_string(),
            input_type: input_type.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn classifies_by_attribute_keywords() {
        assert_eq!(classify_field(&field("firstname", "text", "input")), FieldKind::FirstName);
        assert_eq!(classify_field(&field("family-name", "text", "input")), FieldKind::LastName);
        assert_eq!(classify_field(&field("email-address", "text", "input")), FieldKind::Email);
        assert_eq!(classify_field(&field("mobile", "text", "input")), FieldKind::Phone);
        assert_eq!(classify_field(&field("expected_rate", "text", "input")), FieldKind::Salary);
    }

    #[test]
    fn first_name_wins_over_generic_name() {
        // "first-name" contains "name"; the more specific table entry
        // must be checked first.
        assert_eq!(classify_field(&field("first-name", "text", "input")), FieldKind::FirstName);
        assert_eq!(classify_field(&field("name", "text", "input")), FieldKind::FullName);
    }

    #[test]
    fn classifies_by_input_type_when_attributes_say_nothing() {
        assert_eq!(classify_field(&field("f3", "email", "input")), FieldKind::Email);
        assert_eq!(classify_field(&field("f4", "tel", "input")), FieldKind::Phone);
        assert_eq!(classify_field(&field("f5", "file", "input")), FieldKind::Resume);
        assert_eq!(classify_field(&field("f6", "", "textarea")), FieldKind::Message);
        assert_eq!(classify_field(&field("f7", "text", "input")), FieldKind::Unknown);
    }

    #[test]
    fn fuzzy_match_tolerates_misspellings() {
        assert_eq!(classify_field(&field("emial", "text", "input")), FieldKind::Email);
        assert_eq!(classify_field(&field("telephon", "text", "input")), FieldKind::Phone);
    }

    #[test]
    fn placeholder_and_aria_label_are_considered() {
        let mut f = field("q17", "text", "input");
        f.placeholder = "Your phone number".to_string();
        assert_eq!(classify_field(&f), FieldKind::Phone);

        let mut f = field("q18", "text", "input");
        f.aria_label = "City of residence".to_string();
        assert_eq!(classify_field(&f), FieldKind::Location);
    }

    #[test]
    fn profile_values_map_to_field_kinds() {
        let mut profile = UserProfile::default();
        profile.first_name = "Ada".to_string();
        profile.last_name = "Lovelace".to_string();
        profile.email = "ada@example.com".to_string();
        profile.experience_years = 9;

        assert_eq!(value_for(FieldKind::FirstName, &profile).unwrap(), "Ada");
        assert_eq!(value_for(FieldKind::FullName, &profile).unwrap(), "Ada Lovelace");
        assert_eq!(value_for(FieldKind::Email, &profile).unwrap(), "ada@example.com");
        assert_eq!(value_for(FieldKind::Experience, &profile).unwrap(), "9");
        assert_eq!(
            value_for(FieldKind::LinkedIn, &profile).unwrap(),
            "linkedin.com/in/ada-lovelace"
        );
        assert!(value_for(FieldKind::Message, &profile).unwrap().contains("9 years"));
        // No automatic answers for these.
        assert!(value_for(FieldKind::Salary, &profile).is_none());
        assert!(value_for(FieldKind::Resume, &profile).is_none());
    }

    #[test]
    fn empty_profile_fields_yield_no_value() {
        let profile = UserProfile::default();
        assert!(value_for(FieldKind::FirstName, &profile).is_none());
        assert!(value_for(FieldKind::Email, &profile).is_none());
        assert!(value_for(FieldKind::LinkedIn, &profile).is_none());
    }

    #[test]
    fn registry_knows_supported_sites() {
        for site in supported_sites() {
            let spec = spec_for(site).unwrap();
            assert_eq!(spec.site, *site);
            assert!(!spec.apply_button.is_empty());
            assert!(!spec.submit_button.is_empty());
            assert!(!spec.required_fields.is_empty());
        }
        assert!(spec_for("monster").is_none());
    }
}
