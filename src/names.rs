//! Random container name generation
//!
//! Names are `adjective_surname` pairs. Retries append a short random
//! number so repeated collisions still converge quickly.

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "admiring",
    "adoring",
    "agitated",
    "amazing",
    "angry",
    "backstabbing",
    "berserk",
    "boring",
    "clever",
    "cocky",
    "compassionate",
    "condescending",
    "cranky",
    "desperate",
    "determined",
    "distracted",
    "dreamy",
    "drunk",
    "ecstatic",
    "elated",
    "elegant",
    "evil",
    "fervent",
    "focused",
    "furious",
    "gloomy",
    "goofy",
    "grave",
    "happy",
    "high",
    "hopeful",
    "hungry",
    "insane",
    "jolly",
    "jovial",
    "kickass",
    "lonely",
    "loving",
    "mad",
    "modest",
    "naughty",
    "nostalgic",
    "pensive",
    "prickly",
    "reverent",
    "romantic",
    "sad",
    "serene",
    "sharp",
    "sick",
    "silly",
    "sleepy",
    "stoic",
    "stupefied",
    "suspicious",
    "tender",
    "thirsty",
    "trusting",
];

const SURNAMES: &[&str] = &[
    "albattani",
    "archimedes",
    "ardinghelli",
    "babbage",
    "bardeen",
    "bartik",
    "bell",
    "blackwell",
    "bohr",
    "brattain",
    "brown",
    "carson",
    "colden",
    "curie",
    "darwin",
    "davinci",
    "einstein",
    "elion",
    "engelbart",
    "euclid",
    "fermat",
    "fermi",
    "feynman",
    "franklin",
    "galileo",
    "goldstine",
    "goodall",
    "hawking",
    "heisenberg",
    "hodgkin",
    "hoover",
    "hopper",
    "hypatia",
    "jones",
    "kirch",
    "kowalevski",
    "lalande",
    "leakey",
    "lovelace",
    "lumiere",
    "mayer",
    "mccarthy",
    "mcclintock",
    "mclean",
    "meitner",
    "mestorf",
    "morse",
    "newton",
    "nobel",
    "pare",
    "pasteur",
    "perlman",
    "pike",
    "poincare",
    "ptolemy",
    "ritchie",
    "rosalind",
    "sammet",
    "shockley",
    "sinoussi",
    "stallman",
    "tesla",
    "thompson",
    "torvalds",
    "turing",
    "wilson",
    "wozniak",
    "wright",
    "yalow",
    "yonath",
];

/// Generate a random name. `retry > 0` appends a disambiguating number.
pub fn get_random_name(retry: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut name = format!(
        "{}_{}",
        ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())],
        SURNAMES[rng.gen_range(0..SURNAMES.len())]
    );
    if retry > 0 {
        name = format!("{}{}", name, rng.gen_range(0..10));
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_shape() {
        let name = get_random_name(0);
        let parts: Vec<&str> = name.split('_').collect();
        assert_eq!(parts.len(), 2);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(SURNAMES.contains(&parts[1]));
    }

    #[test]
    fn test_retry_appends_digit() {
        let name = get_random_name(1);
        assert!(name.chars().last().unwrap().is_ascii_digit());
    }

    #[test]
    fn test_names_vary() {
        let names: std::collections::HashSet<String> =
            (0..50).map(|_| get_random_name(0)).collect();
        // 58 * 70 combinations; 50 draws colliding down to one name would
        // mean a broken generator.
        assert!(names.len() > 1);
    }
}
