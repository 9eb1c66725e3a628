//! Stop strings for one generation.

use chatweave_config::AppConfig;

/// Collects the participant names and template sequences that end a reply.
#[derive(Debug, Clone, Default)]
pub struct StopStringBuilder {
    pub user_name: String,
    pub character_name: String,
    /// Other group participants, if any
    pub group_members: Vec<String>,
    /// Instruct sequences; empty when instruct mode is off
    pub instruct_sequences: Vec<String>,
    pub custom: Vec<String>,
}

impl StopStringBuilder {
    pub fn from_config(config: &AppConfig) -> Self {
        let instruct_sequences = if config.instruct.enabled {
            config.instruct.sequences()
        } else {
            Vec::new()
        };
        Self {
            user_name: config.names.user.clone(),
            character_name: config.names.character.clone(),
            group_members: Vec::new(),
            instruct_sequences,
            custom: config.output.custom_stop_strings.clone(),
        }
    }

    /// Every participant except the one speaking, deduplicated.
    pub fn others(&self, is_impersonate: bool) -> Vec<&str> {
        let speaker = self.speaker(is_impersonate);
        let mut names: Vec<&str> = Vec::new();
        let candidates = [self.user_name.as_str(), self.character_name.as_str()]
            .into_iter()
            .chain(self.group_members.iter().map(String::as_str));
        for name in candidates {
            if name.is_empty() || name == speaker || names.contains(&name) {
                continue;
            }
            names.push(name);
        }
        names
    }

    pub fn speaker(&self, is_impersonate: bool) -> &str {
        if is_impersonate {
            &self.user_name
        } else {
            &self.character_name
        }
    }

    /// Build the stop set: `\n{name}:` for the other participants, then
    /// template sequences, then custom strings, in first-seen order.
    pub fn build(&self, is_impersonate: bool) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |s: String| {
            if !s.is_empty() && !out.contains(&s) {
                out.push(s);
            }
        };

        for name in self.others(is_impersonate) {
            push(format!("\n{name}:"));
        }
        for seq in &self.instruct_sequences {
            push(seq.clone());
        }
        for custom in &self.custom {
            push(custom.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> StopStringBuilder {
        StopStringBuilder {
            user_name: "User".into(),
            character_name: "Aria".into(),
            ..Default::default()
        }
    }

    #[test]
    fn character_reply_stops_on_user() {
        assert_eq!(builder().build(false), vec!["\nUser:"]);
    }

    #[test]
    fn impersonation_stops_on_character() {
        assert_eq!(builder().build(true), vec!["\nAria:"]);
    }

    #[test]
    fn group_members_and_custom_strings_deduplicated() {
        let b = StopStringBuilder {
            group_members: vec!["Aria".into(), "Bram".into(), "Bram".into()],
            instruct_sequences: vec!["### Instruction:".into()],
            custom: vec!["\nUser:".into(), "END".into()],
            ..builder()
        };
        assert_eq!(
            b.build(false),
            vec!["\nUser:", "\nBram:", "### Instruction:", "END"]
        );
    }

    #[test]
    fn instruct_sequences_only_when_enabled() {
        let mut config = AppConfig::default();
        assert!(StopStringBuilder::from_config(&config).instruct_sequences.is_empty());
        config.instruct.enabled = true;
        let b = StopStringBuilder::from_config(&config);
        assert!(b.instruct_sequences.contains(&"### Instruction:".to_string()));
    }
}
