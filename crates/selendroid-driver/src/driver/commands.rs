//! Locally handled commands.
//!
//! [`CommandTable`] maps a command name to its handler. Generic Android
//! handlers go in first, then the Selendroid-specific ones, which replace
//! any Android handler of the same name.

use std::collections::HashMap;

use futures::future::BoxFuture;
use selendroid_core::error::ApiError;
use selendroid_core::input::{encode_string, join_value};
use selendroid_core::protocol::HttpMethod;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::proxy::JsonWireProxy;
use super::session::SelendroidDriver;

pub const NATIVE_CONTEXT: &str = "NATIVE_APP";
pub const CHROMIUM_CONTEXT: &str = "CHROMIUM";
/// Context the driver switches to for `autoWebview`.
pub const DEFAULT_WEBVIEW_CONTEXT: &str = "WEBVIEW_0";

const KEYCODE_BACK: i64 = 4;

// Bits of the network connection mask
const AIRPLANE_MODE: u64 = 1;
const WIFI: u64 = 2;
const DATA: u64 = 4;

/// Arguments of one command: captured path segments and the JSON body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandParams {
    pub url: HashMap<String, String>,
    pub body: Value,
}

impl CommandParams {
    pub fn new(url: HashMap<String, String>, body: Value) -> Self {
        Self { url, body }
    }

    pub fn from_body(body: Value) -> Self {
        Self {
            url: HashMap::new(),
            body,
        }
    }

    fn url_param(&self, name: &str) -> Result<&str, ApiError> {
        self.url
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ApiError::internal(format!("route is missing the '{}' segment", name)))
    }

    fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name).filter(|v| !v.is_null())
    }

    fn required(&self, name: &str) -> Result<&Value, ApiError> {
        self.field(name)
            .ok_or_else(|| ApiError::validation(format!("Missing '{}' in request body", name)))
    }

    fn str_field(&self, name: &str) -> Result<&str, ApiError> {
        self.required(name)?
            .as_str()
            .ok_or_else(|| ApiError::validation(format!("'{}' must be a string", name)))
    }

    fn keycode(&self) -> Result<i64, ApiError> {
        let value = self.required("keycode")?;
        value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| ApiError::validation("'keycode' must be an integer"))
    }
}

pub type CommandResult = Result<Value, ApiError>;

/// A command handler. Borrows the driver for the duration of the call.
pub type CommandHandler =
    for<'a> fn(&'a mut SelendroidDriver, CommandParams) -> BoxFuture<'a, CommandResult>;

/// Which layer a handler came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Android,
    Selendroid,
}

const ANDROID_COMMANDS: &[(&str, CommandHandler)] = &[
    ("pressKeyCode", android::press_key_code),
    ("getCurrentContext", android::get_current_context),
    ("setContext", android::set_context),
    ("getLogTypes", android::get_log_types),
    ("getLog", android::get_log),
    ("setGeoLocation", android::set_geo_location),
    ("getNetworkConnection", android::get_network_connection),
    ("setNetworkConnection", android::set_network_connection),
    ("availableIMEEngines", android::available_ime_engines),
    ("getActiveIMEEngine", android::get_active_ime_engine),
    ("isIMEActivated", android::is_ime_activated),
    ("activateIMEEngine", android::activate_ime_engine),
    ("deactivateIMEEngine", android::deactivate_ime_engine),
    ("getStrings", android::get_strings),
    ("closeApp", android::close_app),
];

const SELENDROID_COMMANDS: &[(&str, CommandHandler)] = &[
    ("setValue", selendroid::set_value),
    ("keys", selendroid::keys),
    ("getElementRect", selendroid::get_element_rect),
    ("performMultiAction", selendroid::perform_multi_action),
    ("keyevent", selendroid::keyevent),
    ("back", selendroid::back),
    ("getContexts", selendroid::get_contexts),
    ("launchApp", selendroid::launch_app),
    ("reset", selendroid::reset),
];

/// Command name to handler, built once per driver.
pub struct CommandTable {
    handlers: HashMap<&'static str, (CommandHandler, Origin)>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::layered(ANDROID_COMMANDS, SELENDROID_COMMANDS)
    }

    /// Selendroid entries replace Android entries of the same name.
    fn layered(
        android: &[(&'static str, CommandHandler)],
        selendroid: &[(&'static str, CommandHandler)],
    ) -> Self {
        let mut handlers = HashMap::new();
        for (name, handler) in android {
            handlers.insert(*name, (*handler, Origin::Android));
        }
        for (name, handler) in selendroid {
            handlers.insert(*name, (*handler, Origin::Selendroid));
        }
        Self { handlers }
    }

    pub fn get(&self, name: &str) -> Option<CommandHandler> {
        self.handlers.get(name).map(|(handler, _)| *handler)
    }

    pub fn origin(&self, name: &str) -> Option<Origin> {
        self.handlers.get(name).map(|(_, origin)| *origin)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `name` is the context served by Chromedriver rather than
/// Selendroid. Exact match only.
pub fn is_chromedriver_context(name: &str) -> bool {
    name == CHROMIUM_CONTEXT
}

/// Ask Selendroid to switch to the window named `name`.
pub async fn switch_context(proxy: &JsonWireProxy, name: &str) -> Result<(), ApiError> {
    proxy
        .command("/window", HttpMethod::Post, Some(json!({ "name": name })))
        .await?;
    Ok(())
}

fn network_mask(airplane: bool, wifi: bool, data: bool) -> u64 {
    let mut mask = 0;
    if airplane {
        mask |= AIRPLANE_MODE;
    }
    if wifi {
        mask |= WIFI;
    }
    if data {
        mask |= DATA;
    }
    mask
}

/// Generic Android behaviour Selendroid has no override for.
mod android {
    use super::*;

    pub(super) fn press_key_code(
        driver: &mut SelendroidDriver,
        params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            driver.device()?.keyevent(params.keycode()?).await?;
            Ok(Value::Null)
        })
    }

    pub(super) fn get_current_context(
        driver: &mut SelendroidDriver,
        _params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move { Ok(json!(driver.session()?.current_context)) })
    }

    pub(super) fn set_context(
        driver: &mut SelendroidDriver,
        params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            let name = match params.field("name") {
                Some(Value::String(name)) => name.clone(),
                Some(_) => return Err(ApiError::validation("'name' must be a string")),
                None => NATIVE_CONTEXT.to_string(),
            };
            if driver.session()?.current_context == name {
                return Ok(Value::Null);
            }

            let handler = driver
                .commands()
                .get("getContexts")
                .ok_or_else(|| ApiError::internal("getContexts is not registered"))?;
            let contexts = handler(&mut *driver, CommandParams::default()).await?;
            let known = contexts
                .as_array()
                .is_some_and(|all| all.iter().any(|c| c.as_str() == Some(name.as_str())));
            if !known {
                return Err(ApiError::no_such_context(&name));
            }
            if is_chromedriver_context(&name) {
                return Err(ApiError::not_implemented(
                    "Switching to the Chromedriver webview context is not supported",
                ));
            }

            switch_context(driver.proxy()?.as_ref(), &name).await?;
            info!("Switched context to {}", name);
            driver.session_mut()?.current_context = name;
            Ok(Value::Null)
        })
    }

    pub(super) fn get_log_types(
        _driver: &mut SelendroidDriver,
        _params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move { Ok(json!(["logcat"])) })
    }

    pub(super) fn get_log(
        driver: &mut SelendroidDriver,
        params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            let log_type = params.str_field("type")?;
            if log_type != "logcat" {
                return Err(ApiError::validation(format!(
                    "Unsupported log type '{}'. Supported types: [\"logcat\"]",
                    log_type
                )));
            }
            let logs = driver.device()?.logcat_logs().await?;
            serde_json::to_value(logs).map_err(|e| ApiError::internal(e.to_string()))
        })
    }

    pub(super) fn set_geo_location(
        driver: &mut SelendroidDriver,
        params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            let location = params.required("location")?;
            let coordinate = |name: &str| location.get(name).and_then(Value::as_f64);
            let (Some(latitude), Some(longitude)) = (coordinate("latitude"), coordinate("longitude"))
            else {
                return Err(ApiError::validation(
                    "'location' needs numeric 'latitude' and 'longitude'",
                ));
            };
            driver
                .device()?
                .set_geolocation(latitude, longitude, coordinate("altitude"))
                .await?;
            Ok(location.clone())
        })
    }

    pub(super) fn get_network_connection(
        driver: &mut SelendroidDriver,
        _params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            let device = driver.device()?;
            let mask = network_mask(
                device.is_airplane_mode_on().await?,
                device.is_wifi_on().await?,
                device.is_data_on().await?,
            );
            Ok(json!(mask))
        })
    }

    pub(super) fn set_network_connection(
        driver: &mut SelendroidDriver,
        params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            let mask = params
                .field("parameters")
                .and_then(|p| p.get("type"))
                .or_else(|| params.field("type"))
                .and_then(Value::as_u64)
                .ok_or_else(|| ApiError::validation("Missing network connection 'type' mask"))?;

            let device = driver.device()?;
            let airplane = mask & AIRPLANE_MODE != 0;
            info!("Setting network connection to {}", mask);
            device.set_airplane_mode(airplane).await?;
            if !airplane {
                device.set_wifi(mask & WIFI != 0).await?;
                device.set_data(mask & DATA != 0).await?;
            }

            let mask = network_mask(
                device.is_airplane_mode_on().await?,
                device.is_wifi_on().await?,
                device.is_data_on().await?,
            );
            Ok(json!(mask))
        })
    }

    pub(super) fn available_ime_engines(
        driver: &mut SelendroidDriver,
        _params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move { Ok(json!(driver.device()?.available_imes().await?)) })
    }

    pub(super) fn get_active_ime_engine(
        driver: &mut SelendroidDriver,
        _params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move { Ok(json!(driver.device()?.default_ime().await?)) })
    }

    pub(super) fn is_ime_activated(
        _driver: &mut SelendroidDriver,
        _params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        // IMEs are always active on Android
        Box::pin(async move { Ok(json!(true)) })
    }

    pub(super) fn activate_ime_engine(
        driver: &mut SelendroidDriver,
        params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            let engine = params.str_field("engine")?;
            let device = driver.device()?;
            if !device.available_imes().await?.iter().any(|i| i == engine) {
                return Err(ApiError::command_failed_with_suggestion(
                    format!("IME engine '{}' is not available", engine),
                    "Call GET /ime/available_engines to list the installed engines",
                ));
            }
            device.enable_ime(engine).await?;
            device.set_ime(engine).await?;
            Ok(Value::Null)
        })
    }

    pub(super) fn deactivate_ime_engine(
        driver: &mut SelendroidDriver,
        _params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            let device = driver.device()?;
            if let Some(engine) = device.default_ime().await? {
                device.disable_ime(&engine).await?;
            }
            Ok(Value::Null)
        })
    }

    pub(super) fn get_strings(
        driver: &mut SelendroidDriver,
        params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            let language = params.field("language").and_then(Value::as_str);
            let strings = driver.get_strings(language).await?;
            Ok(Value::Object(strings))
        })
    }

    pub(super) fn close_app(
        driver: &mut SelendroidDriver,
        _params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            driver.close_app().await?;
            Ok(Value::Null)
        })
    }
}

/// Overrides for what Selendroid does differently.
mod selendroid {
    use super::*;

    fn encoded_value(driver: &SelendroidDriver, params: &CommandParams) -> Result<String, ApiError> {
        let text = join_value(params.required("value")?)?;
        Ok(encode_string(&text, driver.capabilities().unicode_keyboard()))
    }

    pub(super) fn set_value(
        driver: &mut SelendroidDriver,
        params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            let element_id = params.url_param("elementId")?;
            let text = encoded_value(driver, &params)?;
            driver
                .proxy()?
                .command(
                    &format!("/element/{}/value", element_id),
                    HttpMethod::Post,
                    Some(json!({ "value": [text] })),
                )
                .await
                .map_err(Into::into)
        })
    }

    pub(super) fn keys(
        driver: &mut SelendroidDriver,
        params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            let text = encoded_value(driver, &params)?;
            driver
                .proxy()?
                .command("/keys", HttpMethod::Post, Some(json!({ "value": [text] })))
                .await
                .map_err(Into::into)
        })
    }

    /// Selendroid has no `/rect`; build one from location and size.
    pub(super) fn get_element_rect(
        driver: &mut SelendroidDriver,
        params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            let element_id = params.url_param("elementId")?;
            let proxy = driver.proxy()?;
            let location = proxy
                .command(&format!("/element/{}/location", element_id), HttpMethod::Get, None)
                .await?;
            let size = proxy
                .command(&format!("/element/{}/size", element_id), HttpMethod::Get, None)
                .await?;

            let mut rect = Map::new();
            for part in [location, size] {
                if let Value::Object(fields) = part {
                    rect.extend(fields);
                }
            }
            Ok(Value::Object(rect))
        })
    }

    pub(super) fn perform_multi_action(
        driver: &mut SelendroidDriver,
        params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            if params.field("elementId").is_some() {
                return Err(ApiError::not_implemented(
                    "Selendroid actions do not support element id",
                ));
            }
            let actions = params.field("actions").cloned().unwrap_or(Value::Null);
            driver
                .proxy()?
                .command("/action", HttpMethod::Post, Some(json!({ "payload": actions })))
                .await
                .map_err(Into::into)
        })
    }

    pub(super) fn keyevent(
        driver: &mut SelendroidDriver,
        params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            if params.field("metastate").is_some() {
                warn!("Selendroid does not support key event meta state, ignoring it");
            }
            driver.device()?.keyevent(params.keycode()?).await?;
            Ok(Value::Null)
        })
    }

    /// No UI automation hook, so press the hardware back key.
    pub(super) fn back(
        driver: &mut SelendroidDriver,
        _params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            driver.device()?.keyevent(KEYCODE_BACK).await?;
            Ok(Value::Null)
        })
    }

    /// Selendroid window handles plus the Chromium devtools context if one
    /// is open.
    pub(super) fn get_contexts(
        driver: &mut SelendroidDriver,
        _params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            let handles = driver
                .proxy()?
                .command("/window_handles", HttpMethod::Get, None)
                .await?;
            let mut contexts: Vec<String> = handles
                .as_array()
                .map(|all| {
                    all.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            let webviews = driver.device()?.webview_contexts().await?;
            if webviews.iter().any(|w| is_chromedriver_context(w))
                && !contexts.iter().any(|c| is_chromedriver_context(c))
            {
                contexts.push(CHROMIUM_CONTEXT.to_string());
            }
            debug!("Available contexts: {:?}", contexts);
            Ok(json!(contexts))
        })
    }

    pub(super) fn launch_app(
        driver: &mut SelendroidDriver,
        _params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            driver.start_selendroid_session().await?;
            Ok(Value::Null)
        })
    }

    pub(super) fn reset(
        driver: &mut SelendroidDriver,
        _params: CommandParams,
    ) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            driver.reset().await?;
            Ok(Value::Null)
        })
    }
}
