use url::Url;

use crate::{
    consts::BLOCKED_PROBE_PATH,
    error::{BcError, Result},
};

/// Builds the `test` and `bind` uris of one channel
#[derive(Debug, Clone)]
pub struct UriBuilder {
    test: Url,
    bind: Url,
    extra: Vec<(String, String)>,
}

impl UriBuilder {
    pub fn new(base: &Url, extra: Vec<(String, String)>) -> Result<Self> {
        let mut root = base.clone();
        root.set_query(None);
        root.set_fragment(None);
        if !root.path().ends_with('/') {
            let path = format!("{}/", root.path());
            root.set_path(&path);
        }

        Ok(Self {
            test: root.join("test")?,
            bind: root.join("bind")?,
            extra,
        })
    }

    /// Adds parameters sent with every request
    pub fn add_params(&mut self, params: Vec<(String, String)>) {
        self.extra.extend(params);
    }

    pub fn test(
        &self,
        host_prefix: Option<&str>,
        version: u32,
        handler_params: &[(String, String)],
        params: &[(&str, String)],
    ) -> Url {
        self.build(&self.test, host_prefix, version, handler_params, params)
    }

    pub fn bind(
        &self,
        host_prefix: Option<&str>,
        version: u32,
        handler_params: &[(String, String)],
        params: &[(&str, String)],
    ) -> Url {
        self.build(&self.bind, host_prefix, version, handler_params, params)
    }

    /// `{prefix}.{host}/mail/images/cleardot.gif` on the channel's scheme
    pub fn blocked_probe(&self, prefix: &str) -> Result<Url> {
        let host = self
            .test
            .host_str()
            .ok_or_else(|| BcError::BadConfig("channel url has no host".to_string()))?;
        let mut uri = Url::parse(&format!("{}://{}.{}", self.test.scheme(), prefix, host))?;
        uri.set_path(BLOCKED_PROBE_PATH);
        Ok(uri)
    }

    fn build(
        &self,
        base: &Url,
        host_prefix: Option<&str>,
        version: u32,
        handler_params: &[(String, String)],
        params: &[(&str, String)],
    ) -> Url {
        let mut uri = base.clone();
        if let (Some(prefix), Some(host)) = (host_prefix, base.host_str()) {
            let prefixed = format!("{prefix}.{host}");
            if let Err(e) = uri.set_host(Some(&prefixed)) {
                tracing::warn!(error = %e, host = %prefixed, "Ignoring unusable host prefix");
            }
        }

        {
            let mut query = uri.query_pairs_mut();
            for (key, value) in &self.extra {
                query.append_pair(key, value);
            }
            query.append_pair("VER", &version.to_string());
            for (key, value) in handler_params {
                query.append_pair(key, value);
            }
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }
        uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(uri: &Url, name: &str) -> Option<String> {
        uri.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    #[test]
    fn joins_below_channel_root() {
        let base = Url::parse("http://example.com/channel").unwrap();
        let uris = UriBuilder::new(&base, Vec::new()).unwrap();
        let test = uris.test(None, 8, &[], &[("MODE", "init".to_string())]);
        assert_eq!(test.path(), "/channel/test");
        assert_eq!(param(&test, "VER").as_deref(), Some("8"));
        assert_eq!(param(&test, "MODE").as_deref(), Some("init"));
    }

    #[test]
    fn adds_prefix_and_params() {
        let base = Url::parse("http://example.com/channel/").unwrap();
        let uris = UriBuilder::new(&base, vec![("a".into(), "xyz".into())]).unwrap();
        let bind = uris.bind(
            Some("b1"),
            8,
            &[("user".into(), "me".into())],
            &[("RID", "rpc".to_string())],
        );
        assert_eq!(bind.host_str(), Some("b1.example.com"));
        assert_eq!(bind.path(), "/channel/bind");
        assert_eq!(param(&bind, "a").as_deref(), Some("xyz"));
        assert_eq!(param(&bind, "user").as_deref(), Some("me"));
        assert_eq!(param(&bind, "RID").as_deref(), Some("rpc"));
    }

    #[test]
    fn blocked_probe_uses_prefix_host() {
        let base = Url::parse("https://example.com/channel").unwrap();
        let uris = UriBuilder::new(&base, Vec::new()).unwrap();
        assert_eq!(
            uris.blocked_probe("blocked").unwrap().as_str(),
            "https://blocked.example.com/mail/images/cleardot.gif"
        );
    }
}
