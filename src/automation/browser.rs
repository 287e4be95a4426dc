//! Thin wrapper over a thirtyfour WebDriver session.
//!
//! One `Browser` is one browser context owned by exactly one attempt.
//! Every operation carries its own timeout; element waits poll with a
//! deadline so nothing blocks indefinitely.

use std::path::PathBuf;
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use crate::error::StepError;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct Browser {
    driver: WebDriver,
    timeout: Duration,
    screenshot_dir: PathBuf,
}

impl Browser {
    pub async fn connect(
        webdriver_url: &str,
        headless: bool,
        op_timeout: Duration,
        screenshot_dir: &str,
    ) -> Result<Self, StepError> {
        let mut caps = DesiredCapabilities::chrome();
        if headless {
            caps.add_arg("--headless=new")
                .map_err(|e| StepError::Engine(e.to_string()))?;
        }
        caps.add_arg("--disable-gpu")
            .map_err(|e| StepError::Engine(e.to_string()))?;

        let driver = WebDriver::new(webdriver_url, caps)
            .await
            .map_err(|e| StepError::Engine(format!("webdriver unavailable: {e}")))?;

        Ok(Self {
            driver,
            timeout: op_timeout,
            screenshot_dir: PathBuf::from(screenshot_dir),
        })
    }

    pub async fn goto(&self, url: &str) -> Result<(), StepError> {
        debug!(%url, "navigating");
        match timeout(self.timeout, self.driver.goto(url)).await {
            Err(_) => Err(StepError::Timeout(format!("navigate to {url}"))),
            Ok(Err(e)) => Err(StepError::Network(e.to_string())),
            Ok(Ok(())) => Ok(()),
        }
    }

    pub async fn current_url(&self) -> Result<String, StepError> {
        self.driver
            .current_url()
            .await
            .map(|u| u.to_string())
            .map_err(|e| StepError::Network(e.to_string()))
    }

    /// First element matching any of the candidate selectors, polling
    /// until the operation timeout expires.
    pub async fn wait_for_any(&self, selectors: &[&str]) -> Result<WebElement, StepError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            for selector in selectors {
                if let Ok(element) = self.driver.find(By::Css(*selector)).await {
                    return Ok(element);
                }
            }
            if Instant::now() >= deadline {
                return Err(StepError::ElementNotFound(selectors.join(", ")));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Single probe with no polling, for cheap presence checks.
    pub async fn any_present(&self, selectors: &[&str]) -> bool {
        for selector in selectors {
            if self.driver.find(By::Css(*selector)).await.is_ok() {
                return true;
            }
        }
        false
    }

    pub async fn find_all(&self, selector: &str) -> Result<Vec<WebElement>, StepError> {
        self.driver
            .find_all(By::Css(selector))
            .await
            .map_err(|e| StepError::Network(e.to_string()))
    }

    pub async fn fill(&self, element: &WebElement, value: &str) -> Result<(), StepError> {
        element
            .clear()
            .await
            .map_err(|e| StepError::Network(e.to_string()))?;
        element
            .send_keys(value)
            .await
            .map_err(|e| StepError::Network(e.to_string()))
    }

    pub async fn click_any(&self, selectors: &[&str]) -> Result<(), StepError> {
        let element = self.wait_for_any(selectors).await?;
        element
            .click()
            .await
            .map_err(|e| StepError::Network(e.to_string()))
    }

    pub async fn page_text(&self) -> Result<String, StepError> {
        let body = self
            .driver
            .find(By::Tag("body"))
            .await
            .map_err(|e| StepError::ElementNotFound(format!("body: {e}")))?;
        body.text()
            .await
            .map_err(|e| StepError::Network(e.to_string()))
    }

    pub async fn screenshot(&self, label: &str) -> Result<String, StepError> {
        std::fs::create_dir_all(&self.screenshot_dir)
            .map_err(|e| StepError::Engine(e.to_string()))?;
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let path = self.screenshot_dir.join(format!("{label}_{stamp}.png"));
        self.driver
            .screenshot(&path)
            .await
            .map_err(|e| StepError::Engine(format!("screenshot failed: {e}")))?;
        Ok(path.to_string_lossy().into_owned())
    }

    pub async fn quit(&self) {
        // Nothing sensible to do if teardown fails; the session is gone.
        let _ = self.driver.clone().quit().await;
    }
}
