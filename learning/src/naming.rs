//! Derives a capability's `(namespace, action)` pair from its submitted
//! intent string. How `namespace`/`action` are chosen from an arbitrary
//! intent is resolved here (see `DESIGN.md`): an intent of the form
//! `namespace:action` is
//! taken literally; anything else falls back to a generic `capability`
//! namespace with the whole intent slugified as the action.

const DEFAULT_NAMESPACE: &str = "capability";
const DEFAULT_ACTION: &str = "run";

pub fn derive_namespace_action(intent: &str) -> (String, String) {
    if let Some((namespace, action)) = intent.split_once(':') {
        let namespace = slugify(namespace, DEFAULT_NAMESPACE);
        let action = slugify(action, DEFAULT_ACTION);
        (namespace, action)
    } else {
        (DEFAULT_NAMESPACE.to_string(), slugify(intent, DEFAULT_ACTION))
    }
}

fn slugify(raw: &str, fallback: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    let mut last_was_underscore = false;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_underscore = false;
        } else if !last_was_underscore && !slug.is_empty() {
            slug.push('_');
            last_was_underscore = true;
        }
    }
    let slug = slug.trim_end_matches('_').to_string();
    if slug.is_empty() {
        fallback.to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_colon_action_is_taken_literally() {
        assert_eq!(
            derive_namespace_action("fs:read_json"),
            ("fs".to_string(), "read_json".to_string())
        );
    }

    #[test]
    fn free_text_intent_falls_back_to_default_namespace() {
        let (namespace, action) = derive_namespace_action("Fetch the weather for Tokyo");
        assert_eq!(namespace, "capability");
        assert_eq!(action, "fetch_the_weather_for_tokyo");
    }

    #[test]
    fn empty_intent_falls_back_to_default_action() {
        let (_, action) = derive_namespace_action("   ");
        assert_eq!(action, "run");
    }
}
