use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{Client, Method, Url};
use scraper::{Html, Selector};
use tracing::debug;

use crate::error::FetchError;
use crate::record::Roll;

const ROLL_FIELD: &str = "roll";
const SUBMIT_ID: &str = "button2";
const RESULT_MARKER: &str = "tftable";

static FORM: LazyLock<Selector> = LazyLock::new(|| Selector::parse("form").unwrap());
static ROLL_INPUT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(&format!(r#"input[name="{}"]"#, ROLL_FIELD)).unwrap());
static SUBMIT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(&format!("#{}", SUBMIT_ID)).unwrap());
static NAMED_INPUT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("input[name], select[name], textarea[name]").unwrap());
static MARKER: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(&format!("table.{}", RESULT_MARKER)).unwrap());

/// Raw HTML of a result page.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub html: String,
}

/// One navigate / fill / submit / wait cycle against the lookup service.
pub trait Fetcher {
    async fn fetch(&mut self, roll: Roll) -> Result<RawPage, FetchError>;

    /// Release whatever the fetcher holds. Called once on every exit path of a run.
    async fn close(&mut self) {}
}

/// Fetcher that drives the lookup form over plain HTTP.
pub struct HttpFetcher {
    client: Client,
    url: Url,
    step_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(url: &str, step_timeout: Duration) -> Result<Self, FetchError> {
        let url = Url::parse(url)
            .map_err(|e| FetchError::Automation(format!("invalid lookup url {}: {}", url, e)))?;
        let client = Client::builder()
            .cookie_store(true)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpFetcher {
            client,
            url,
            step_timeout,
        })
    }

    async fn step<T>(
        &self,
        step: &'static str,
        fut: impl Future<Output = Result<T, FetchError>>,
    ) -> Result<T, FetchError> {
        tokio::time::timeout(self.step_timeout, fut)
            .await
            .map_err(|_| FetchError::Timeout {
                step,
                after: self.step_timeout,
            })?
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&mut self, roll: Roll) -> Result<RawPage, FetchError> {
        let form_html = self
            .step("lookup form", async {
                let resp = self.client.get(self.url.clone()).send().await?;
                Ok::<_, FetchError>(resp.error_for_status()?.text().await?)
            })
            .await?;
        let form = parse_form(&form_html, &self.url, roll)?;
        debug!(roll, action = %form.action, "Submitting lookup form");

        let html = self
            .step("result page", async {
                let req = if form.method == Method::GET {
                    self.client.get(form.action.clone()).query(&form.fields)
                } else {
                    self.client.request(form.method.clone(), form.action.clone()).form(&form.fields)
                };
                Ok::<_, FetchError>(req.send().await?.error_for_status()?.text().await?)
            })
            .await?;

        if !has_marker(&html) {
            return Err(FetchError::MarkerMissing(RESULT_MARKER));
        }
        Ok(RawPage { html })
    }
}

#[derive(Debug)]
struct FormSubmission {
    method: Method,
    action: Url,
    fields: Vec<(String, String)>,
}

/// Locate the form holding the roll input and build its submission with `roll` filled in.
fn parse_form(html: &str, base: &Url, roll: Roll) -> Result<FormSubmission, FetchError> {
    let doc = Html::parse_document(html);
    if doc.select(&ROLL_INPUT).next().is_none() {
        return Err(FetchError::Automation(format!("input `{}` not found", ROLL_FIELD)));
    }
    let submit = doc
        .select(&SUBMIT)
        .next()
        .ok_or_else(|| FetchError::Automation(format!("submit control `#{}` not found", SUBMIT_ID)))?;
    let form = doc
        .select(&FORM)
        .find(|f| f.select(&ROLL_INPUT).next().is_some())
        .ok_or_else(|| FetchError::Automation("roll input is not inside a form".into()))?;

    let action = match form.value().attr("action").filter(|a| !a.trim().is_empty()) {
        Some(a) => base
            .join(a.trim())
            .map_err(|e| FetchError::Automation(format!("bad form action {}: {}", a, e)))?,
        None => base.clone(),
    };
    let method = match form.value().attr("method") {
        Some(m) if m.eq_ignore_ascii_case("post") => Method::POST,
        _ => Method::GET,
    };

    let mut fields = Vec::new();
    for input in form.select(&NAMED_INPUT) {
        let el = input.value();
        let Some(name) = el.attr("name") else { continue };
        let kind = el.attr("type").unwrap_or("text").to_ascii_lowercase();
        if matches!(kind.as_str(), "submit" | "button" | "image" | "reset") {
            continue;
        }
        let toggle = matches!(kind.as_str(), "radio" | "checkbox");
        if toggle && el.attr("checked").is_none() {
            continue;
        }
        if name == ROLL_FIELD {
            fields.push((name.to_string(), roll.to_string()));
        } else {
            let default = if toggle { "on" } else { "" };
            fields.push((name.to_string(), el.attr("value").unwrap_or(default).to_string()));
        }
    }
    if let Some(name) = submit.value().attr("name") {
        let value = submit.value().attr("value").unwrap_or("");
        fields.push((name.to_string(), value.to_string()));
    }

    Ok(FormSubmission {
        method,
        action,
        fields,
    })
}

fn has_marker(html: &str) -> bool {
    Html::parse_document(html).select(&MARKER).next().is_some()
}


#[cfg(test)]
pub(crate) mod stub {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{Fetcher, RawPage};
    use crate::error::FetchError;
    use crate::record::Roll;

    #[derive(Clone)]
    pub enum Reply {
        Page(String),
        Timeout,
    }

    /// Replays scripted replies per roll; the last reply repeats once the script runs out.
    #[derive(Default)]
    pub struct StubFetcher {
        script: HashMap<Roll, Vec<Reply>>,
        pub calls: Vec<Roll>,
        pub closed: bool,
    }

    impl StubFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, roll: Roll, replies: Vec<Reply>) -> Self {
            self.script.insert(roll, replies);
            self
        }

        pub fn calls_for(&self, roll: Roll) -> usize {
            self.calls.iter().filter(|r| **r == roll).count()
        }
    }

    impl Fetcher for StubFetcher {
        async fn fetch(&mut self, roll: Roll) -> Result<RawPage, FetchError> {
            let n = self.calls_for(roll);
            self.calls.push(roll);
            let reply = self
                .script
                .get(&roll)
                .and_then(|r| r.get(n).or_else(|| r.last()))
                .cloned()
                .unwrap_or(Reply::Timeout);
            match reply {
                Reply::Page(html) => Ok(RawPage { html }),
                Reply::Timeout => Err(FetchError::Timeout {
                    step: "result page",
                    after: Duration::from_secs(20),
                }),
            }
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    pub fn result_html(roll: Roll, name: &str, reg: &str) -> String {
        format!(
            r#"<table class="tftable">
<tr><td>Roll No</td><td>{roll}</td><td>Name</td><td>{name}</td></tr>
<tr><td>Board</td><td>CHATTOGRAM</td><td>Father's Name</td><td>KARIM</td></tr>
<tr><td>Session</td><td>2022-2023</td><td>Reg. NO</td><td>{reg}</td></tr>
<tr><td>Institute</td><td>SCHOOL {roll}</td><td>Result</td><td>GPA=5.00</td></tr>
</table>
<table class="tftable2">
<tr><td>Code</td><td>Subject</td><td>Grade</td></tr>
<tr><td>101</td><td>BANGLA-I</td><td>80(A+)</td></tr>
</table>"#
        )
    }

    pub fn blank_html(roll: Roll) -> String {
        format!(
            r#"<table class="tftable">
<tr><td>Roll No</td><td>{roll}</td><td>Name</td><td></td></tr>
<tr><td>Result</td><td></td><td>Reg. NO</td><td></td></tr>
</table>
<table class="tftable2"><tr><td>Code</td><td>Subject</td><td>Grade</td></tr></table>"#
        )
    }
}
