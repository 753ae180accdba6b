//! Id generation
//!
//! Plans, subtasks, and related records share one id shape:
//! `{6-hex}-{kind}-{slug}`, e.g. `019876-plan-add-oauth`. The hex prefix
//! comes from a v7 uuid so ids sort roughly by creation time; the slug keeps
//! ids readable in logs and git branch names.

use uuid::Uuid;

/// Slugs stop growing past this many characters
const MAX_SLUG_CHARS: usize = 48;

/// Generate an id of the form `{6-hex}-{kind}-{slug}`
///
/// A title with no usable characters yields `{6-hex}-{kind}`.
pub fn generate_id(kind: &str, title: &str) -> String {
    let hex = Uuid::now_v7().simple().to_string();
    let slug = slugify(title);
    if slug.is_empty() {
        format!("{}-{kind}", &hex[..6])
    } else {
        format!("{}-{kind}-{slug}", &hex[..6])
    }
}

/// Reduce a title to lowercase words joined by single hyphens
///
/// Apostrophes vanish ("don't" becomes "dont"); any other run of
/// non-alphanumeric characters acts as one word boundary.
fn slugify(title: &str) -> String {
    let mut slug = String::new();

    for word in title.split(|c: char| !c.is_alphanumeric() && !is_apostrophe(c)) {
        let cleaned: String = word
            .chars()
            .filter(|c| !is_apostrophe(*c))
            .flat_map(char::to_lowercase)
            .collect();
        if cleaned.is_empty() {
            continue;
        }

        if !slug.is_empty() {
            slug.push('-');
        }
        slug.push_str(&cleaned);

        if slug.chars().count() >= MAX_SLUG_CHARS {
            break;
        }
    }

    slug
}

fn is_apostrophe(c: char) -> bool {
    matches!(c, '\'' | '’' | '‘')
}
