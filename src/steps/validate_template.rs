//! Pre-flight check of the configured products against the remote catalog.

use std::sync::Arc;

use tracing::debug;

use super::halt;
use crate::api::ProvisioningApi;
use crate::config::Config;
use crate::error::{BuilderError, Result};
use crate::state::StateBag;
use crate::step::{Step, StepAction};
use crate::ui::Ui;

const NAME: &str = "validate_template";

/// Checks the configured image and server products against the remote catalog
/// before anything is allocated.
pub struct StepValidateTemplate {
    api: Arc<dyn ProvisioningApi>,
    ui: Arc<dyn Ui>,
    region: String,
    server_image_product_code: Option<String>,
    member_server_image_no: Option<String>,
    server_product_code: String,
}

impl StepValidateTemplate {
    pub fn new(api: Arc<dyn ProvisioningApi>, ui: Arc<dyn Ui>, config: &Config) -> Self {
        Self {
            api,
            ui,
            region: config.region.clone(),
            server_image_product_code: config.server_image_product_code.clone(),
            member_server_image_no: config.member_server_image_no.clone(),
            server_product_code: config.server_product_code.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(image_no) = &self.member_server_image_no {
            let image = self.api.get_member_server_image(image_no)?;
            self.ui
                .message(&format!("Member server image: {} ({})", image.name, image.image_no));
            return Ok(());
        }

        let Some(code) = &self.server_image_product_code else {
            return Err(BuilderError::step(
                NAME,
                "neither server_image_product_code nor member_server_image_no is set",
            ));
        };

        let images = self.api.list_server_image_products(&self.region)?;
        let Some(image) = images.iter().find(|p| &p.product_code == code) else {
            let available: Vec<&str> = images.iter().map(|p| p.product_code.as_str()).collect();
            return Err(BuilderError::step(
                NAME,
                format!(
                    "server_image_product_code '{}' is not offered in region {} (available: {})",
                    code,
                    self.region,
                    available.join(", ")
                ),
            ));
        };
        self.ui
            .message(&format!("Server image product: {}", image.product_name));

        let servers = self.api.list_server_products(&self.region, code)?;
        debug!("{} server product(s) available for {}", servers.len(), code);
        if !servers
            .iter()
            .any(|p| p.product_code == self.server_product_code)
        {
            return Err(BuilderError::step(
                NAME,
                format!(
                    "server_product_code '{}' cannot be used with image product '{}'",
                    self.server_product_code, code
                ),
            ));
        }
        Ok(())
    }
}

impl Step for StepValidateTemplate {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        self.ui.say("Validating deployment template ...");
        match self.validate() {
            Ok(()) => StepAction::Continue,
            Err(err) => halt(state, self.ui.as_ref(), err),
        }
    }
}
